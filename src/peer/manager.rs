use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::comms::{Block, PeerCommand, PeerComms, PeerEvent, PeerName, PeerTuple, RegistryEvent};
use crate::constants::{CHANNEL_CAPACITY, IDLE_TIMEOUT};
use crate::torrent::TorrentLayout;

use super::peer_id::PeerId;
use super::session::{PeerSession, SessionContext};

/// Producer ends feeding the manager: tracker endpoints and accepted
/// connections from the listen server.
#[derive(Debug, Clone)]
pub struct ManagerTx {
    pub peers: mpsc::Sender<PeerTuple>,
    pub conns: mpsc::Sender<TcpStream>,
}

/// Consumer ends owned by the manager.
#[derive(Debug)]
pub struct ManagerRx {
    peers: mpsc::Receiver<PeerTuple>,
    conns: mpsc::Receiver<TcpStream>,
}

/// Creates the bounded channel set connecting the tracker client and the
/// listen server to the peer manager.
pub fn manager_channels() -> (ManagerTx, ManagerRx) {
    let (peers_tx, peers_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (conns_tx, conns_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        ManagerTx {
            peers: peers_tx,
            conns: conns_tx,
        },
        ManagerRx {
            peers: peers_rx,
            conns: conns_rx,
        },
    )
}

// Lifecycle reports from the per-session driver tasks.
enum SessionEvent {
    Established(PeerName),
    Dead(PeerName),
}

struct PeerSlot {
    commands: mpsc::Sender<PeerCommand>,
    // Whether the controller was told about this peer. Sessions that die
    // during the handshake are reaped without the controller ever hearing
    // of them.
    announced: bool,
}

/// Registry of live peer sessions.
///
/// The manager mediates session creation and destruction and nothing else:
/// it never interprets protocol traffic. Tracker endpoints become outbound
/// dialers, accepted connections become acceptor sessions, duplicates are
/// silently ignored, and dead sessions are reaped. The controller is
/// notified only once a session has completed its handshake.
pub struct PeerManager {
    our_peer_id: PeerId,
    layout: TorrentLayout,
    peers: HashMap<PeerName, PeerSlot>,
    rx: ManagerRx,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: mpsc::Receiver<SessionEvent>,
    registry: mpsc::Sender<RegistryEvent>,
    peer_events: mpsc::Sender<PeerEvent>,
    blocks: mpsc::Sender<Block>,
    shutdown: broadcast::Sender<()>,
}

impl PeerManager {
    pub fn new(
        our_peer_id: PeerId,
        layout: TorrentLayout,
        rx: ManagerRx,
        registry: mpsc::Sender<RegistryEvent>,
        peer_events: mpsc::Sender<PeerEvent>,
        blocks: mpsc::Sender<Block>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let (session_tx, session_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            our_peer_id,
            layout,
            peers: HashMap::new(),
            rx,
            session_tx,
            session_rx,
            registry,
            peer_events,
            blocks,
            shutdown,
        }
    }

    /// Runs the manager until the shutdown signal fires, then waits for
    /// every session to be reaped before returning.
    pub async fn run(mut self) {
        debug!("peer manager started");
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                Some(endpoint) = self.rx.peers.recv() => self.handle_endpoint(endpoint),
                Some(conn) = self.rx.conns.recv() => self.handle_inbound(conn),
                Some(event) = self.session_rx.recv() => self.handle_session_event(event).await,
                _ = shutdown_rx.recv() => break,
                else => break,
            }
        }

        // Sessions received the same shutdown signal; each reports dead as
        // it unwinds.
        while !self.peers.is_empty() {
            match self.session_rx.recv().await {
                Some(event) => self.handle_session_event(event).await,
                None => break,
            }
        }
        debug!("peer manager stopped");
    }

    /// Number of sessions currently registered.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // Registers a slot for `peer_name` and builds the context its session
    // will run with.
    fn register(&mut self, peer_name: &PeerName) -> SessionContext {
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.peers.insert(
            peer_name.clone(),
            PeerSlot {
                commands: commands_tx,
                announced: false,
            },
        );
        SessionContext {
            our_peer_id: self.our_peer_id,
            layout: self.layout.clone(),
            commands: commands_rx,
            events: self.peer_events.clone(),
            blocks: self.blocks.clone(),
            shutdown: self.shutdown.subscribe(),
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    fn handle_endpoint(&mut self, endpoint: PeerTuple) {
        let peer_name = endpoint.peer_name();
        if self.peers.contains_key(&peer_name) {
            return;
        }

        debug!(peer = %peer_name, "dialing");
        let ctx = self.register(&peer_name);
        let session_tx = self.session_tx.clone();
        let addr = SocketAddr::from((endpoint.ip, endpoint.port));

        tokio::spawn(async move {
            match PeerSession::connect(addr, ctx).await {
                Ok(session) => drive(session, session_tx).await,
                Err(error) => {
                    debug!(peer = %peer_name, %error, "dial failed");
                    let _ = session_tx.send(SessionEvent::Dead(peer_name)).await;
                }
            }
        });
    }

    fn handle_inbound(&mut self, conn: TcpStream) {
        let peer_name = match conn.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(error) => {
                debug!(%error, "dropping connection without remote address");
                return;
            }
        };
        if self.peers.contains_key(&peer_name) {
            return;
        }

        debug!(peer = %peer_name, "adopting inbound connection");
        let ctx = self.register(&peer_name);
        let session_tx = self.session_tx.clone();

        tokio::spawn(async move {
            match PeerSession::establish(conn, peer_name.clone(), false, ctx).await {
                Ok(session) => drive(session, session_tx).await,
                Err(error) => {
                    debug!(peer = %peer_name, %error, "inbound handshake failed");
                    let _ = session_tx.send(SessionEvent::Dead(peer_name)).await;
                }
            }
        });
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Established(peer_name) => {
                let Some(slot) = self.peers.get_mut(&peer_name) else {
                    warn!(peer = %peer_name, "established report for unknown session");
                    return;
                };
                slot.announced = true;
                let comms = PeerComms {
                    peer_name: peer_name.clone(),
                    commands: slot.commands.clone(),
                };
                let _ = self.registry.send(RegistryEvent::NewPeer(comms)).await;
            }
            SessionEvent::Dead(peer_name) => {
                debug!(peer = %peer_name, "reaping session");
                if let Some(slot) = self.peers.remove(&peer_name) {
                    if slot.announced {
                        let _ = self
                            .registry
                            .send(RegistryEvent::DeadPeer(peer_name))
                            .await;
                    }
                }
            }
        }
    }
}

// Announces an established session to the manager, runs it, and reports it
// dead when it unwinds.
async fn drive<S>(session: PeerSession<S>, session_tx: mpsc::Sender<SessionEvent>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let peer_name = session.peer_name().to_string();
    let _ = session_tx
        .send(SessionEvent::Established(peer_name.clone()))
        .await;

    if let Err(error) = session.run().await {
        debug!(peer = %peer_name, %error, "session ended");
    }

    let _ = session_tx.send(SessionEvent::Dead(peer_name)).await;
}

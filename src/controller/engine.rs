use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::comms::{
    ControllerRx, PeerCommand, PeerComms, PeerEvent, PeerName, PieceHash, ReceivedPiece,
    RegistryEvent,
};
use crate::constants::MAX_SIMULTANEOUS_DOWNLOADS_PER_PEER;

use super::rarity::{sorted_piece_slice, PiecePriority, RarityMap};

/// The controller's view of one connected peer.
pub struct PeerInfo {
    peer_name: PeerName,
    commands: mpsc::Sender<PeerCommand>,
    is_choked: bool,
    available_pieces: Vec<bool>,
    active_requests: HashSet<u32>,
    // Pieces this peer has that we still need. Refreshed on completion so
    // peers close to running out of useful work can be fed first.
    qty_pieces_needed: usize,
}

impl PeerInfo {
    fn new(piece_count: usize, comms: PeerComms) -> Self {
        Self {
            peer_name: comms.peer_name,
            commands: comms.commands,
            // A fresh connection starts choked by the other side.
            is_choked: true,
            available_pieces: vec![false; piece_count],
            active_requests: HashSet::new(),
            qty_pieces_needed: 0,
        }
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_choked(&self) -> bool {
        self.is_choked
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.available_pieces
            .get(piece as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn active_requests(&self) -> &HashSet<u32> {
        &self.active_requests
    }

    pub fn qty_pieces_needed(&self) -> usize {
        self.qty_pieces_needed
    }
}

/// The download decision engine.
///
/// The controller is the sole owner of the global download state: which
/// pieces are finished, what every peer has advertised, and which peer is
/// fetching what. It consumes events from disk-I/O, the peer manager, and
/// the sessions one at a time, and reacts by dispatching request, cancel,
/// and announce commands.
///
/// Piece selection is rarest-first with bounded per-peer parallelism:
/// candidates a peer can serve are ranked by how many other peers already
/// fetch them, rarity breaking ties, and assigned until the peer's cap is
/// reached.
///
/// State inconsistencies (an event about an unknown peer, a duplicate
/// advertisement, requests left over after a cancellation sweep) are
/// programming errors and panic; protocol misbehavior never reaches this
/// actor, it kills the offending session instead.
pub struct Controller {
    finished_pieces: Vec<bool>,
    piece_hashes: Vec<PieceHash>,
    active_requests_totals: Vec<u32>,
    peers: HashMap<PeerName, PeerInfo>,
    max_downloads_per_peer: usize,
    rx: ControllerRx,
    shutdown: broadcast::Receiver<()>,
}

impl Controller {
    /// Creates a controller over the given resume state and hash list.
    ///
    /// `finished_pieces` carries whatever verification found on disk at
    /// startup; all-false for a fresh download.
    pub fn new(
        finished_pieces: Vec<bool>,
        piece_hashes: Vec<PieceHash>,
        rx: ControllerRx,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        assert_eq!(
            finished_pieces.len(),
            piece_hashes.len(),
            "one hash per piece"
        );
        let active_requests_totals = vec![0; finished_pieces.len()];
        Self {
            finished_pieces,
            piece_hashes,
            active_requests_totals,
            peers: HashMap::new(),
            max_downloads_per_peer: MAX_SIMULTANEOUS_DOWNLOADS_PER_PEER,
            rx,
            shutdown,
        }
    }

    /// Overrides the per-peer parallelism cap.
    pub fn with_max_downloads_per_peer(mut self, cap: usize) -> Self {
        assert!(cap > 0, "per-peer download cap must be positive");
        self.max_downloads_per_peer = cap;
        self
    }

    pub fn piece_count(&self) -> usize {
        self.finished_pieces.len()
    }

    pub fn finished_pieces(&self) -> &[bool] {
        &self.finished_pieces
    }

    pub fn active_requests_totals(&self) -> &[u32] {
        &self.active_requests_totals
    }

    pub fn max_downloads_per_peer(&self) -> usize {
        self.max_downloads_per_peer
    }

    pub fn peer(&self, peer_name: &str) -> Option<&PeerInfo> {
        self.peers.get(peer_name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True once every piece is finished.
    pub fn is_complete(&self) -> bool {
        self.finished_pieces.iter().all(|&f| f)
    }

    /// Runs the event loop until the shutdown signal fires.
    pub async fn run(mut self) {
        debug!("controller started");
        loop {
            tokio::select! {
                Some(piece) = self.rx.received_piece.recv() => {
                    self.handle_received_piece(piece).await;
                }
                Some(event) = self.rx.registry.recv() => match event {
                    RegistryEvent::NewPeer(comms) => self.handle_new_peer(comms).await,
                    RegistryEvent::DeadPeer(peer_name) => self.handle_dead_peer(&peer_name),
                },
                Some(event) = self.rx.peer_events.recv() => match event {
                    PeerEvent::ChokeStatus { peer_name, is_choked } => {
                        self.handle_choke_status(&peer_name, is_choked).await;
                    }
                    PeerEvent::HaveBatch { peer_name, pieces } => {
                        self.handle_have_batch(&peer_name, &pieces).await;
                    }
                },
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        debug!("controller stopped");
    }

    /// Disk-I/O verified a piece: record it, announce it, cancel duplicate
    /// fetches, and hand out fresh work starting with the peers that have
    /// the least left to offer.
    pub async fn handle_received_piece(&mut self, piece: ReceivedPiece) {
        let index = piece.piece as usize;
        assert!(
            index < self.finished_pieces.len(),
            "verified piece {} out of range",
            piece.piece
        );
        assert!(
            self.peers.contains_key(&piece.peer_name),
            "verified piece {} attributed to unknown peer {}",
            piece.piece,
            piece.peer_name
        );
        debug!(peer = %piece.peer_name, piece = piece.piece, "piece verified");

        self.finished_pieces[index] = true;
        self.send_have_to_peers_missing(piece.piece).await;
        self.remove_piece_from_active_requests(&piece).await;

        let rarity_slice = self.rarity_slice();
        self.refresh_qty_pieces_needed();
        for peer_name in self.peers_by_qty_needed() {
            let info = &self.peers[&peer_name];
            if !info.is_choked && info.active_requests.len() < self.max_downloads_per_peer {
                self.send_requests_to_peer(&peer_name, &rarity_slice).await;
            }
        }
    }

    /// A session finished its handshake. Register it and announce our
    /// finished pieces; requests wait until the peer's bitfield arrives.
    pub async fn handle_new_peer(&mut self, comms: PeerComms) {
        let peer_name = comms.peer_name.clone();
        debug!(peer = %peer_name, "new peer");

        let info = PeerInfo::new(self.finished_pieces.len(), comms);
        let commands = info.commands.clone();
        let previous = self.peers.insert(peer_name.clone(), info);
        assert!(previous.is_none(), "duplicate peer {}", peer_name);

        let finished: Vec<u32> = self
            .finished_pieces
            .iter()
            .enumerate()
            .filter(|(_, &finished)| finished)
            .map(|(piece, _)| piece as u32)
            .collect();
        if !finished.is_empty() {
            let _ = commands.send(PeerCommand::HaveBatch(finished)).await;
        }
    }

    /// A previously announced session died: return its unfinished work to
    /// the pool and forget it.
    pub fn handle_dead_peer(&mut self, peer_name: &str) {
        let Some(info) = self.peers.remove(peer_name) else {
            panic!("dead peer {} is not in the registry", peer_name);
        };
        debug!(peer = %peer_name, "removing peer");
        for piece in info.active_requests {
            self.active_requests_totals[piece as usize] -= 1;
        }
    }

    /// The remote flipped its choke state: flush the peer's work on choke,
    /// hand out work on unchoke.
    pub async fn handle_choke_status(&mut self, peer_name: &str, is_choked: bool) {
        let Some(info) = self.peers.get_mut(peer_name) else {
            panic!("choke status for unknown peer {}", peer_name);
        };
        debug!(peer = %peer_name, is_choked, "choke status changed");
        info.is_choked = is_choked;

        if is_choked {
            for piece in info.active_requests.drain() {
                self.active_requests_totals[piece as usize] -= 1;
            }
        } else {
            let rarity_slice = self.rarity_slice();
            self.send_requests_to_peer(peer_name, &rarity_slice).await;
        }
    }

    /// The peer advertised pieces: its decoded bitfield as one batch, or a
    /// HAVE as a singleton batch. At batch close, hand out work if the peer
    /// can take it.
    pub async fn handle_have_batch(&mut self, peer_name: &str, pieces: &[u32]) {
        let piece_count = self.finished_pieces.len();
        let Some(info) = self.peers.get_mut(peer_name) else {
            panic!("have batch from unknown peer {}", peer_name);
        };

        for &piece in pieces {
            let index = piece as usize;
            assert!(
                index < piece_count,
                "peer {} advertised piece {} of {}",
                peer_name,
                piece,
                piece_count
            );
            assert!(
                !info.available_pieces[index],
                "duplicate advertisement of piece {} from {}",
                piece,
                peer_name
            );
            info.available_pieces[index] = true;
        }

        if !info.is_choked && info.active_requests.len() < self.max_downloads_per_peer {
            let rarity_slice = self.rarity_slice();
            self.send_requests_to_peer(peer_name, &rarity_slice).await;
        }
    }

    // Announces a freshly finished piece to every peer that did not
    // advertise it themselves.
    async fn send_have_to_peers_missing(&mut self, piece: u32) {
        let targets: Vec<(PeerName, mpsc::Sender<PeerCommand>)> = self
            .peers
            .values()
            .filter(|info| !info.available_pieces[piece as usize])
            .map(|info| (info.peer_name.clone(), info.commands.clone()))
            .collect();

        for (peer_name, commands) in targets {
            debug!(peer = %peer_name, piece, "announcing finished piece");
            let _ = commands.send(PeerCommand::HaveBatch(vec![piece])).await;
        }
    }

    // Clears the finished piece out of every active-request set, cancelling
    // the fetch on peers other than the finisher. Afterwards nobody may be
    // fetching it.
    async fn remove_piece_from_active_requests(&mut self, piece: &ReceivedPiece) {
        let index = piece.piece as usize;

        if let Some(finisher) = self.peers.get_mut(&piece.peer_name) {
            if finisher.active_requests.remove(&piece.piece) {
                self.active_requests_totals[index] -= 1;
            } else {
                warn!(
                    peer = %piece.peer_name,
                    piece = piece.piece,
                    "finished a piece that was not in its active request list"
                );
            }
        }

        let mut cancels = Vec::new();
        for (peer_name, info) in self.peers.iter_mut() {
            if peer_name != &piece.peer_name && info.active_requests.remove(&piece.piece) {
                self.active_requests_totals[index] -= 1;
                cancels.push((peer_name.clone(), info.commands.clone()));
            }
        }
        for (peer_name, commands) in cancels {
            debug!(peer = %peer_name, piece = piece.piece, "cancelling duplicate fetch");
            let _ = commands
                .send(PeerCommand::CancelPiece { piece: piece.piece })
                .await;
        }

        let stuck = self.active_requests_totals[index];
        assert!(
            stuck == 0,
            "{} stuck requests for piece {} after cancellation",
            stuck,
            piece.piece
        );
    }

    // How many unchoked peers hold each piece. Choked peers are excluded:
    // they cannot serve us.
    fn peer_piece_totals(&self) -> Vec<u32> {
        let mut totals = vec![0u32; self.finished_pieces.len()];
        for info in self.peers.values() {
            if info.is_choked {
                continue;
            }
            for (piece, &has) in info.available_pieces.iter().enumerate() {
                if has {
                    totals[piece] += 1;
                }
            }
        }
        totals
    }

    // Unfinished pieces in ascending rarity order.
    fn rarity_slice(&self) -> Vec<u32> {
        let mut rarity = RarityMap::new();
        for (piece, total) in self.peer_piece_totals().into_iter().enumerate() {
            if self.finished_pieces[piece] {
                continue;
            }
            rarity.put(total, piece as u32);
        }
        rarity.pieces_by_rarity()
    }

    fn refresh_qty_pieces_needed(&mut self) {
        let finished = &self.finished_pieces;
        for info in self.peers.values_mut() {
            info.qty_pieces_needed = info
                .available_pieces
                .iter()
                .zip(finished)
                .filter(|(&has, &done)| has && !done)
                .count();
        }
    }

    // Peer names ordered by how few needed pieces they still offer, so the
    // peers at risk of running out of useful work are fed first.
    fn peers_by_qty_needed(&self) -> Vec<PeerName> {
        let mut ordered: Vec<(usize, PeerName)> = self
            .peers
            .values()
            .map(|info| (info.qty_pieces_needed, info.peer_name.clone()))
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, name)| name).collect()
    }

    // Assigns work to one peer: walk the rarity order, keep pieces the peer
    // has and is not already fetching, rank by how many other peers fetch
    // them (rarity breaking ties), and fill up to the cap.
    async fn send_requests_to_peer(&mut self, peer_name: &str, rarity_slice: &[u32]) {
        let candidates = {
            let Some(info) = self.peers.get(peer_name) else {
                return;
            };
            let mut candidates = Vec::new();
            for (rarity_index, &piece) in rarity_slice.iter().enumerate() {
                if info.available_pieces[piece as usize]
                    && !info.active_requests.contains(&piece)
                {
                    candidates.push(PiecePriority {
                        piece,
                        active_requests_total: self.active_requests_totals[piece as usize],
                        rarity_index,
                    });
                }
            }
            sorted_piece_slice(candidates)
        };

        let Some(info) = self.peers.get_mut(peer_name) else {
            return;
        };
        let commands = info.commands.clone();
        let mut requests = Vec::new();
        for piece in candidates {
            if info.active_requests.len() >= self.max_downloads_per_peer {
                break;
            }
            info.active_requests.insert(piece);
            self.active_requests_totals[piece as usize] += 1;
            requests.push(PeerCommand::RequestPiece {
                piece,
                expected_hash: self.piece_hashes[piece as usize],
            });
        }

        if !requests.is_empty() {
            debug!(peer = %peer_name, count = requests.len(), "dispatching piece requests");
        }
        for command in requests {
            let _ = commands.send(command).await;
        }
    }
}

use super::*;
use crate::comms::{controller_channels, PeerCommand, PeerComms, ReceivedPiece};
use tokio::sync::{broadcast, mpsc};

fn controller(piece_count: usize) -> Controller {
    controller_with_finished(vec![false; piece_count])
}

fn controller_with_finished(finished: Vec<bool>) -> Controller {
    let (_tx, rx) = controller_channels();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let hashes = (0..finished.len()).map(|i| [i as u8; 20]).collect();
    Controller::new(finished, hashes, rx, shutdown_rx)
}

async fn add_peer(ctrl: &mut Controller, name: &str) -> mpsc::Receiver<PeerCommand> {
    let (tx, rx) = mpsc::channel(64);
    ctrl.handle_new_peer(PeerComms {
        peer_name: name.into(),
        commands: tx,
    })
    .await;
    rx
}

fn drain(rx: &mut mpsc::Receiver<PeerCommand>) -> Vec<PeerCommand> {
    let mut out = Vec::new();
    while let Ok(command) = rx.try_recv() {
        out.push(command);
    }
    out
}

fn requested_pieces(commands: &[PeerCommand]) -> Vec<u32> {
    commands
        .iter()
        .filter_map(|command| match command {
            PeerCommand::RequestPiece { piece, .. } => Some(*piece),
            _ => None,
        })
        .collect()
}

// The controller's standing invariants, checked after every event in these
// tests: totals match the per-peer sets, the per-peer cap holds, finished
// pieces are not being fetched, and choked peers hold no requests.
fn assert_invariants(ctrl: &Controller) {
    for piece in 0..ctrl.piece_count() as u32 {
        let holders = ctrl
            .peers()
            .filter(|p| p.active_requests().contains(&piece))
            .count() as u32;
        assert_eq!(
            ctrl.active_requests_totals()[piece as usize],
            holders,
            "totals out of sync for piece {}",
            piece
        );
    }
    for peer in ctrl.peers() {
        assert!(peer.active_requests().len() <= ctrl.max_downloads_per_peer());
        if peer.is_choked() {
            assert!(peer.active_requests().is_empty());
        }
        for piece in peer.active_requests() {
            assert!(!ctrl.finished_pieces()[*piece as usize]);
        }
    }
}

#[tokio::test]
async fn single_peer_full_download() {
    let mut ctrl = controller(4);
    let mut rx = add_peer(&mut ctrl, "1.1.1.1:6881").await;
    assert_invariants(&ctrl);

    ctrl.handle_choke_status("1.1.1.1:6881", false).await;
    ctrl.handle_have_batch("1.1.1.1:6881", &[0, 1, 2, 3]).await;
    assert_invariants(&ctrl);

    let commands = drain(&mut rx);
    let mut pieces = requested_pieces(&commands);
    pieces.sort();
    assert_eq!(pieces, [0, 1, 2, 3]);

    // hashes ride along with each assignment
    for command in &commands {
        if let PeerCommand::RequestPiece {
            piece,
            expected_hash,
        } = command
        {
            assert_eq!(expected_hash, &[*piece as u8; 20]);
        }
    }

    for piece in 0..4 {
        ctrl.handle_received_piece(ReceivedPiece {
            peer_name: "1.1.1.1:6881".into(),
            piece,
        })
        .await;
        assert_invariants(&ctrl);
    }

    assert!(ctrl.is_complete());
    assert_eq!(ctrl.active_requests_totals(), [0, 0, 0, 0]);
    assert!(ctrl.peer("1.1.1.1:6881").unwrap().active_requests().is_empty());
    // the peer advertised everything, so no HAVEs went back to it
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn rarest_first_assignment_order() {
    let mut ctrl = controller(3).with_max_downloads_per_peer(1);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;
    let mut rx_c = add_peer(&mut ctrl, "c:1").await;

    ctrl.handle_have_batch("a:1", &[0, 1]).await;
    ctrl.handle_have_batch("b:1", &[1, 2]).await;
    ctrl.handle_have_batch("c:1", &[1]).await;
    assert_invariants(&ctrl);

    // choked peers get nothing
    assert!(drain(&mut rx_a).is_empty());

    ctrl.handle_choke_status("a:1", false).await;
    ctrl.handle_choke_status("b:1", false).await;
    ctrl.handle_choke_status("c:1", false).await;
    assert_invariants(&ctrl);

    assert_eq!(requested_pieces(&drain(&mut rx_a)), [0]);
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [2]);
    assert_eq!(requested_pieces(&drain(&mut rx_c)), [1]);
}

#[tokio::test]
async fn completion_cancels_duplicate_fetch() {
    let mut ctrl = controller(6).with_max_downloads_per_peer(1);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;

    ctrl.handle_have_batch("a:1", &[5]).await;
    ctrl.handle_have_batch("b:1", &[5]).await;
    ctrl.handle_choke_status("a:1", false).await;
    ctrl.handle_choke_status("b:1", false).await;
    assert_invariants(&ctrl);

    // both peers ended up fetching piece 5
    assert_eq!(requested_pieces(&drain(&mut rx_a)), [5]);
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [5]);
    assert_eq!(ctrl.active_requests_totals()[5], 2);

    ctrl.handle_received_piece(ReceivedPiece {
        peer_name: "a:1".into(),
        piece: 5,
    })
    .await;
    assert_invariants(&ctrl);

    assert_eq!(ctrl.active_requests_totals()[5], 0);
    assert!(!ctrl.peer("b:1").unwrap().active_requests().contains(&5));
    assert!(drain(&mut rx_b)
        .iter()
        .any(|c| matches!(c, PeerCommand::CancelPiece { piece: 5 })));
}

#[tokio::test]
async fn choke_flushes_active_requests() {
    let mut ctrl = controller(10);
    let mut rx = add_peer(&mut ctrl, "a:1").await;

    ctrl.handle_have_batch("a:1", &[7, 8, 9]).await;
    ctrl.handle_choke_status("a:1", false).await;
    assert_invariants(&ctrl);

    let mut pieces = requested_pieces(&drain(&mut rx));
    pieces.sort();
    assert_eq!(pieces, [7, 8, 9]);
    assert_eq!(ctrl.active_requests_totals()[7..], [1, 1, 1]);

    ctrl.handle_choke_status("a:1", true).await;
    assert_invariants(&ctrl);

    assert!(ctrl.peer("a:1").unwrap().active_requests().is_empty());
    assert_eq!(ctrl.active_requests_totals()[7..], [0, 0, 0]);
}

#[tokio::test]
#[should_panic(expected = "duplicate advertisement")]
async fn duplicate_have_is_fatal() {
    let mut ctrl = controller(4);
    let _rx = add_peer(&mut ctrl, "a:1").await;
    ctrl.handle_have_batch("a:1", &[2]).await;
    ctrl.handle_have_batch("a:1", &[2]).await;
}

#[tokio::test]
#[should_panic(expected = "duplicate peer")]
async fn duplicate_new_peer_is_fatal() {
    let mut ctrl = controller(4);
    let _rx1 = add_peer(&mut ctrl, "a:1").await;
    let _rx2 = add_peer(&mut ctrl, "a:1").await;
}

#[tokio::test]
#[should_panic(expected = "unknown peer")]
async fn choke_status_for_unknown_peer_is_fatal() {
    let mut ctrl = controller(4);
    ctrl.handle_choke_status("ghost:1", false).await;
}

#[tokio::test]
#[should_panic(expected = "unknown peer")]
async fn received_piece_from_unknown_peer_is_fatal() {
    let mut ctrl = controller(4);
    ctrl.handle_received_piece(ReceivedPiece {
        peer_name: "ghost:1".into(),
        piece: 0,
    })
    .await;
}

#[tokio::test]
#[should_panic(expected = "not in the registry")]
async fn unknown_dead_peer_is_fatal() {
    let mut ctrl = controller(4);
    ctrl.handle_dead_peer("ghost:1");
}

#[tokio::test]
async fn assignment_skips_peer_already_fetching() {
    let mut ctrl = controller(2).with_max_downloads_per_peer(1);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;

    ctrl.handle_have_batch("a:1", &[0]).await;
    ctrl.handle_have_batch("b:1", &[0]).await;
    ctrl.handle_choke_status("a:1", false).await;
    assert_eq!(requested_pieces(&drain(&mut rx_a)), [0]);

    // piece 0 is already on A's plate, so the next assignment of it lands
    // on B even though another fetch is in flight
    ctrl.handle_choke_status("b:1", false).await;
    assert_invariants(&ctrl);
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [0]);
    assert_eq!(ctrl.peer("a:1").unwrap().active_requests().len(), 1);
    assert_eq!(ctrl.active_requests_totals()[0], 2);
}

#[tokio::test]
async fn fewer_active_fetches_wins_over_rarity() {
    let mut ctrl = controller(2).with_max_downloads_per_peer(1);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;

    ctrl.handle_have_batch("a:1", &[0]).await;
    ctrl.handle_have_batch("b:1", &[0, 1]).await;
    ctrl.handle_choke_status("a:1", false).await;
    assert_eq!(requested_pieces(&drain(&mut rx_a)), [0]);

    // piece 0 is rarer for B's ordering, but somebody is already on it;
    // the untouched piece 1 goes first
    ctrl.handle_choke_status("b:1", false).await;
    assert_invariants(&ctrl);
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [1]);
}

#[tokio::test]
async fn rarity_breaks_ties_between_untouched_pieces() {
    let mut ctrl = controller(3).with_max_downloads_per_peer(1);
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;
    let mut rx_d = add_peer(&mut ctrl, "d:1").await;

    // D fills its slot with piece 2 first
    ctrl.handle_have_batch("d:1", &[2]).await;
    ctrl.handle_choke_status("d:1", false).await;
    assert_eq!(requested_pieces(&drain(&mut rx_d)), [2]);

    // D also turns out to hold piece 0, making it the common piece
    ctrl.handle_have_batch("d:1", &[0]).await;
    assert!(drain(&mut rx_d).is_empty());

    ctrl.handle_have_batch("b:1", &[0, 1]).await;
    ctrl.handle_choke_status("b:1", false).await;
    assert_invariants(&ctrl);

    // neither 0 nor 1 is being fetched; piece 0 is held by two peers and
    // piece 1 by one, so the rarer piece 1 wins the tie
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [1]);
}

#[tokio::test]
async fn new_peer_receives_finished_pieces_as_one_batch() {
    let mut ctrl = controller_with_finished(vec![true, false, true]);
    let mut rx = add_peer(&mut ctrl, "a:1").await;

    assert_eq!(
        drain(&mut rx),
        [PeerCommand::HaveBatch(vec![0, 2])]
    );
}

#[tokio::test]
async fn completion_announces_to_peers_missing_the_piece() {
    let mut ctrl = controller(2);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;

    ctrl.handle_have_batch("a:1", &[0]).await;
    ctrl.handle_choke_status("a:1", false).await;
    drain(&mut rx_a);

    ctrl.handle_received_piece(ReceivedPiece {
        peer_name: "a:1".into(),
        piece: 0,
    })
    .await;
    assert_invariants(&ctrl);

    // B never advertised piece 0 and gets told about it; A did and doesn't
    assert_eq!(drain(&mut rx_b), [PeerCommand::HaveBatch(vec![0])]);
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn dead_peer_returns_unfinished_work() {
    let mut ctrl = controller(4);
    let mut rx = add_peer(&mut ctrl, "a:1").await;

    ctrl.handle_have_batch("a:1", &[0, 1]).await;
    ctrl.handle_choke_status("a:1", false).await;
    drain(&mut rx);
    assert_eq!(ctrl.active_requests_totals()[..2], [1, 1]);

    ctrl.handle_dead_peer("a:1");
    assert_eq!(ctrl.peer_count(), 0);
    assert_eq!(ctrl.active_requests_totals(), [0, 0, 0, 0]);
}

#[tokio::test]
async fn completion_redispatches_to_peers_with_room() {
    let mut ctrl = controller(3).with_max_downloads_per_peer(1);
    let mut rx_a = add_peer(&mut ctrl, "a:1").await;
    let mut rx_b = add_peer(&mut ctrl, "b:1").await;

    ctrl.handle_have_batch("a:1", &[0, 1]).await;
    ctrl.handle_have_batch("b:1", &[1, 2]).await;
    ctrl.handle_choke_status("a:1", false).await;
    ctrl.handle_choke_status("b:1", false).await;
    assert_eq!(requested_pieces(&drain(&mut rx_a)), [0]);
    assert_eq!(requested_pieces(&drain(&mut rx_b)), [2]);

    ctrl.handle_received_piece(ReceivedPiece {
        peer_name: "a:1".into(),
        piece: 0,
    })
    .await;
    assert_invariants(&ctrl);

    // A freed a slot and picks up piece 1; B is still at its cap
    assert_eq!(requested_pieces(&drain(&mut rx_a)), [1]);
    assert!(requested_pieces(&drain(&mut rx_b)).is_empty());
    assert_eq!(ctrl.peer("b:1").unwrap().active_requests().len(), 1);
}

#[tokio::test]
async fn batch_close_dispatches_only_below_cap() {
    let mut ctrl = controller(3).with_max_downloads_per_peer(1);
    let mut rx = add_peer(&mut ctrl, "a:1").await;

    ctrl.handle_have_batch("a:1", &[0]).await;
    ctrl.handle_choke_status("a:1", false).await;
    assert_eq!(requested_pieces(&drain(&mut rx)), [0]);

    // a later HAVE while at the cap records availability but assigns nothing
    ctrl.handle_have_batch("a:1", &[1]).await;
    assert_invariants(&ctrl);
    assert!(ctrl.peer("a:1").unwrap().has_piece(1));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn finished_pieces_are_monotonic() {
    let mut ctrl = controller(2);
    let mut rx = add_peer(&mut ctrl, "a:1").await;
    ctrl.handle_have_batch("a:1", &[0, 1]).await;
    ctrl.handle_choke_status("a:1", false).await;
    drain(&mut rx);

    ctrl.handle_received_piece(ReceivedPiece {
        peer_name: "a:1".into(),
        piece: 0,
    })
    .await;
    assert!(ctrl.finished_pieces()[0]);

    // a choke/unchoke cycle later, the finished flag stays up
    ctrl.handle_choke_status("a:1", true).await;
    ctrl.handle_choke_status("a:1", false).await;
    assert_invariants(&ctrl);
    assert!(ctrl.finished_pieces()[0]);
}

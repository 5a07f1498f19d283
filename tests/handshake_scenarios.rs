//! Handshake scenarios: self-dial rejection, duplicate-connection
//! arbitration, duplicate-record merging, and the validation gauntlet every
//! `Identify` runs before a connection authenticates.

mod common;

use std::time::{SystemTime, UNIX_EPOCH};

use common::*;
use weft::messages::{ControlMessage, DisconnectReason};
use weft::{ConnectionState, Direction, PeerState, TransportKind};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// An inbound session that claims our own identity is torn down, the
/// record's address cleared and written off, and the record disposed.
#[test]
fn self_dial_is_rejected_and_disposed() {
    let keypair = mid_keypair();
    let own_identity = keypair.identity();
    let mut net = build_default(keypair);

    let mut remote = net.inject_inbound("203.0.113.5");
    net.pump();
    assert_eq!(net.mgr.peer_count(), 1);

    remote.open();
    net.pump();
    let _our_identify = remote.drain_sent();

    remote.deliver(identify_frame(&own_identity, Some(9033), None, false));
    net.pump();

    assert!(remote.is_closed(), "connection from our own identity closes");
    assert_eq!(net.mgr.peer_count(), 0, "the record is disposed");
    assert!(net.mgr.identified(&own_identity).is_none());
}

/// An outbound direct session is `Connected`; an inbound session from the
/// same identity finishes its handshake. The remote sorts first, so the
/// remote was the designated initiator: the inbound (remote-initiated)
/// session survives and the outbound one closes.
#[test]
fn duplicate_direct_sessions_keep_the_initiators() {
    let keypair = mid_keypair();
    let remote_identity = low_identity(); // sorts below the local identity
    let mut net = build_default(keypair);

    // Outbound session reaches Connected.
    let pid = net.mgr.connect_to_address("192.0.2.8:9033").unwrap();
    net.pump();
    let mut dials = net.take_dials();
    assert_eq!(dials.len(), 1);
    let outbound_remote = &mut dials[0].remote;
    outbound_remote.open();
    net.pump();
    let _ = outbound_remote.drain_sent();
    outbound_remote.deliver(identify_frame(&remote_identity, Some(9033), None, false));
    net.pump();
    assert!(net.mgr.peer(pid).unwrap().state().is_connected());

    // Inbound session from the same identity completes its handshake.
    let mut inbound_remote = net.inject_inbound("192.0.2.8");
    net.pump();
    inbound_remote.open();
    net.pump();
    let _ = inbound_remote.drain_sent();
    inbound_remote.deliver(identify_frame(&remote_identity, Some(9033), None, false));
    net.pump();

    // The outbound session lost the arbitration.
    assert!(outbound_remote.is_closed());
    assert!(!inbound_remote.is_closed());

    let peer = net.mgr.peer(pid).unwrap();
    assert!(peer.state().is_connected());
    let conn = peer.connection(TransportKind::Direct).unwrap();
    assert_eq!(conn.direction(), Direction::Inbound);
    assert!(matches!(conn.state(), ConnectionState::Connected { .. }));

    // One record per identity, and it is the incumbent.
    assert_eq!(net.mgr.identified(&remote_identity), Some(pid));
}

/// An external holder keeps a token for an
/// unidentified record while another record owns the identity. When the
/// unidentified record's session authenticates as that identity, the
/// session migrates to the incumbent; the held token resolves to a
/// disconnected record until the sweep removes it.
#[test]
fn duplicate_record_merge_preserves_the_incumbent() {
    let keypair = mid_keypair();
    let identity_a = low_identity();
    let mut net = build_default(keypair);

    // P2 completes an outbound handshake as A.
    let p2 = net.mgr.connect_to_address("192.0.2.1:9033").unwrap();
    net.pump();
    let mut dials = net.take_dials();
    let outbound_remote = &mut dials[0].remote;
    outbound_remote.open();
    net.pump();
    let _ = outbound_remote.drain_sent();
    outbound_remote.deliver(identify_frame(&identity_a, Some(9033), None, false));
    net.pump();
    assert_eq!(net.mgr.identified(&identity_a), Some(p2));

    // P1 is a fresh inbound record the caller holds a token for.
    let mut inbound_remote = net.inject_inbound("192.0.2.1");
    net.pump();
    let p1 = net
        .mgr
        .summaries()
        .into_iter()
        .find(|s| s.identity.is_none())
        .expect("fresh record exists")
        .id;
    assert_ne!(p1, p2);

    // P1's session identifies as A: it migrates onto P2 (and, the remote
    // being the designated initiator, supersedes P2's outbound session).
    inbound_remote.open();
    net.pump();
    let _ = inbound_remote.drain_sent();
    inbound_remote.deliver(identify_frame(&identity_a, Some(9033), None, false));
    net.pump();

    assert_eq!(net.mgr.identified(&identity_a), Some(p2), "incumbent keeps the identity");
    let p2_ref = net.mgr.peer(p2).unwrap();
    assert!(p2_ref.state().is_connected());
    assert_eq!(
        p2_ref.connection(TransportKind::Direct).unwrap().direction(),
        Direction::Inbound
    );

    // The held token still resolves, to a disconnected record...
    assert_eq!(net.mgr.peer(p1).unwrap().state(), PeerState::Disconnected);

    // ...until the sweep disposes it.
    net.mgr.dispose_peers();
    assert!(net.mgr.peer(p1).is_none());
    assert_eq!(net.mgr.identified(&identity_a), Some(p2));
}

#[test]
fn malformed_identity_closes_the_connection() {
    let mut net = build_default(mid_keypair());
    let mut remote = net.inject_inbound("203.0.113.1");
    net.pump();
    remote.open();
    net.pump();
    let _ = remote.drain_sent();

    remote.deliver(control_frame(ControlMessage::Identify(
        weft::messages::IdentifyPayload {
            identity: "!!!not-an-identity!!!".to_string(),
            version: "weft/1/remote".to_string(),
            port: None,
            name: None,
            is_worker: false,
        },
    )));
    net.pump();
    assert!(remote.is_closed());
}

#[test]
fn incompatible_version_closes_the_connection() {
    let mut net = build_default(mid_keypair());
    let mut remote = net.inject_inbound("203.0.113.2");
    net.pump();
    remote.open();
    net.pump();
    let _ = remote.drain_sent();

    remote.deliver(control_frame(ControlMessage::Identify(
        weft::messages::IdentifyPayload {
            identity: low_identity().to_base64(),
            version: "weft/2/remote".to_string(),
            port: None,
            name: None,
            is_worker: false,
        },
    )));
    net.pump();
    assert!(remote.is_closed());
    assert!(net.mgr.identified(&low_identity()).is_none());
}

#[test]
fn oversized_name_closes_the_connection() {
    let mut net = build_default(mid_keypair());
    let mut remote = net.inject_inbound("203.0.113.3");
    net.pump();
    remote.open();
    net.pump();
    let _ = remote.drain_sent();

    let long_name = "n".repeat(33);
    remote.deliver(identify_frame(
        &low_identity(),
        Some(9033),
        Some(&long_name),
        false,
    ));
    net.pump();
    assert!(remote.is_closed());
}

#[test]
fn application_data_before_identify_closes_the_connection() {
    let mut net = build_default(mid_keypair());
    let mut remote = net.inject_inbound("203.0.113.4");
    net.pump();
    remote.open();
    net.pump();
    let _ = remote.drain_sent();

    remote.deliver(data_frame(b"too early"));
    net.pump();
    assert!(remote.is_closed());
    assert!(net.drain_events().iter().all(|e| !matches!(e, weft::MeshEvent::Message { .. })));
}

#[test]
fn second_identify_closes_the_connection() {
    let mut net = build_default(mid_keypair());
    let (pid, mut remote) = net.connect_identified(low_identity(), Some("dup"));
    assert!(net.mgr.peer(pid).unwrap().state().is_connected());

    remote.deliver(identify_frame(&low_identity(), Some(9033), None, false));
    net.pump();
    assert!(remote.is_closed());
    assert_eq!(net.mgr.peer(pid).unwrap().state(), PeerState::Disconnected);
}

/// A completed inbound handshake adopts the advertised port and populates
/// name, version, and the worker flag; the identity registry satisfies
/// `identified[id].identity == id`.
#[test]
fn handshake_populates_the_record() {
    let mut net = build_default(mid_keypair());
    let identity = low_identity();

    let mut remote = net.inject_inbound("198.51.100.20");
    net.pump();
    remote.open();
    net.pump();
    let controls = sent_controls(&mut remote);
    assert!(
        matches!(controls.as_slice(), [ControlMessage::Identify(p)] if p.identity == net.mgr.local().identity().to_base64()),
        "our identify goes out first"
    );

    remote.deliver(identify_frame(&identity, Some(7777), Some("miner-9"), true));
    net.pump();

    let pid = net.mgr.identified(&identity).unwrap();
    let peer = net.mgr.peer(pid).unwrap();
    assert_eq!(peer.identity(), Some(&identity));
    assert_eq!(peer.port(), Some(7777), "inbound sessions adopt the advertised port");
    assert_eq!(peer.address(), Some("198.51.100.20"));
    assert_eq!(peer.name(), Some("miner-9"));
    assert!(peer.is_worker());
    assert_eq!(peer.version().unwrap().protocol, 1);
    assert!(peer.display_name().starts_with("miner-9@"));
}

/// After `disconnect(peer, reason, until)`, a re-handshake inside the
/// window is answered with a `Disconnecting` notice and refused.
#[test]
fn disconnect_window_refuses_rehandshake() {
    let mut net = build_default(mid_keypair());
    let identity = low_identity();
    let (pid, remote1) = net.connect_identified(identity, None);

    let until = now_ms() + 60_000;
    net.mgr
        .disconnect(pid, DisconnectReason::BadHandshake, until);
    assert!(remote1.is_closed());
    assert_eq!(net.mgr.peer(pid).unwrap().state(), PeerState::Disconnected);

    // The remote tries again inside the window.
    let mut remote2 = net.inject_inbound("198.51.100.9");
    net.pump();
    remote2.open();
    net.pump();
    remote2.deliver(identify_frame(&identity, Some(9033), None, false));
    net.pump();

    let controls = sent_controls(&mut remote2);
    let notice = controls
        .iter()
        .find_map(|m| match m {
            ControlMessage::Disconnecting(p) => Some(p),
            _ => None,
        })
        .expect("disconnect notice sent");
    assert_eq!(notice.reason, DisconnectReason::BadHandshake);
    assert_eq!(notice.disconnect_until_ms, until);
    assert_eq!(notice.destination.as_deref(), Some(identity.to_base64().as_str()));
    assert!(remote2.is_closed());
    assert_eq!(net.mgr.peer(pid).unwrap().state(), PeerState::Disconnected);
}

/// `disconnect` twice with the same arguments leaves the peer in an
/// identical state.
#[test]
fn disconnect_is_idempotent() {
    let mut net = build_default(mid_keypair());
    let identity = low_identity();
    let (pid, _remote) = net.connect_identified(identity, None);
    let until = now_ms() + 30_000;

    net.mgr.disconnect(pid, DisconnectReason::Unknown, until);
    let first_events = net.drain_events();
    assert!(first_events
        .iter()
        .any(|e| matches!(e, weft::MeshEvent::PeerDisconnected { peer } if *peer == pid)));
    let window = net.mgr.peer(pid).unwrap().local_disconnect();

    net.mgr.disconnect(pid, DisconnectReason::Unknown, until);
    assert_eq!(net.mgr.peer(pid).unwrap().local_disconnect(), window);
    assert_eq!(net.mgr.peer(pid).unwrap().state(), PeerState::Disconnected);
    assert!(net.drain_events().is_empty(), "second disconnect is silent");
}

/// An outbound dial that completes its handshake resets the retry slate.
#[test]
fn outbound_handshake_succeeds_and_resets_retry() {
    let mut net = build_default(mid_keypair());
    let pid = net.mgr.connect_to_address("192.0.2.77:1234").unwrap();
    net.pump();
    let mut dials = net.take_dials();
    assert_eq!(dials[0].address, "192.0.2.77");
    assert_eq!(dials[0].port, 1234);

    let remote = &mut dials[0].remote;
    remote.open();
    net.pump();
    let _ = remote.drain_sent();
    remote.deliver(identify_frame(&high_identity(), Some(1234), None, false));
    net.pump();

    let peer = net.mgr.peer(pid).unwrap();
    assert!(peer.state().is_connected());
    assert_eq!(
        peer.connection(TransportKind::Direct).unwrap().direction(),
        Direction::Outbound
    );
    assert_eq!(peer.retry(TransportKind::Direct).consecutive_failures(), 0);
    let events = net.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, weft::MeshEvent::PeerConnected { peer, .. } if *peer == pid)));
}

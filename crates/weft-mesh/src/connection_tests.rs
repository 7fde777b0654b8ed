//! Tests for connection handling.

use super::*;
use test_case::test_case;

fn name(n: u8) -> PeerName {
    PeerName::from_bytes_array([2, 0, 0, 0, 0, n])
}

fn handle(
    uid: u64,
) -> (
    Arc<ConnectionHandle>,
    mpsc::Receiver<ProtocolMsg>,
    mpsc::Receiver<MeshError>,
) {
    ConnectionHandle::new(
        uid,
        name(2),
        "10.0.0.2:6783".to_string(),
        "10.0.0.2:6783".parse().expect("addr"),
        true,
        CancellationToken::new(),
    )
}

fn remote_features() -> Features {
    let mut features = Features::new();
    features.insert(FEATURE_PEER_NAME_FLAVOUR.to_string(), PEER_NAME_FLAVOUR.to_string());
    features.insert(FEATURE_NAME.to_string(), name(2).to_string());
    features.insert(FEATURE_NICK_NAME.to_string(), "bravo".to_string());
    features.insert(FEATURE_UID.to_string(), "77".to_string());
    features.insert(FEATURE_CONN_ID.to_string(), "12345".to_string());
    features
}

// ========== Tie Break Tests ==========

#[test]
fn lower_id_wins() {
    assert_eq!(TieBreak::between(5, 7), TieBreak::Won);
    assert_eq!(TieBreak::between(7, 5), TieBreak::Lost);
}

#[test]
fn equal_ids_tie() {
    assert_eq!(TieBreak::between(5, 5), TieBreak::Tied);
}

#[test]
fn both_ends_agree_on_the_survivor() {
    let (first_a, first_b) = (0x1111_u64, 0x2222_u64);
    let (second_a, second_b) = (0x3333_u64, 0x0404_u64);
    // each end XORs its own id with the remote's, in either order
    let at_a = TieBreak::between(second_a ^ second_b, first_a ^ first_b);
    let at_b = TieBreak::between(second_b ^ second_a, first_b ^ first_a);
    assert_eq!(at_a, at_b);
}

#[test_case(TieBreak::Won, "won" ; "won")]
#[test_case(TieBreak::Lost, "lost" ; "lost")]
#[test_case(TieBreak::Tied, "tied" ; "tied")]
fn tie_break_display(outcome: TieBreak, text: &str) {
    assert_eq!(outcome.to_string(), text);
}

#[test]
fn duplicate_error_names_outcome() {
    let err = MeshError::Duplicate {
        remote: name(2),
        outcome: TieBreak::Lost.to_string(),
    };
    assert_eq!(
        err.to_string(),
        "duplicate connection to 02:00:00:00:00:02: lost"
    );
}

// ========== State Tests ==========

#[test]
fn only_established_is_usable() {
    assert!(ConnectionState::Established.is_usable());
    assert!(!ConnectionState::Handshaking.is_usable());
    assert!(ConnectionState::Closed.is_terminal());
    assert!(!ConnectionState::Connecting.is_terminal());
}

// ========== Remote Intro Tests ==========

#[test]
fn parses_remote_features() {
    let mut features = remote_features();
    features.insert(FEATURE_TRUSTED.to_string(), "true".to_string());

    let intro = RemoteIntro::parse(&features).expect("parse");
    assert_eq!(intro.peer.name, name(2));
    assert_eq!(intro.peer.nick_name, "bravo");
    assert_eq!(intro.peer.uid, 77);
    assert_eq!(intro.conn_id, 12345);
    assert!(intro.trusted);
}

#[test]
fn trusted_defaults_to_false() {
    let intro = RemoteIntro::parse(&remote_features()).expect("parse");
    assert!(!intro.trusted);
}

#[test_case(FEATURE_PEER_NAME_FLAVOUR ; "flavour")]
#[test_case(FEATURE_NAME ; "name")]
#[test_case(FEATURE_NICK_NAME ; "nick name")]
#[test_case(FEATURE_UID ; "uid")]
#[test_case(FEATURE_CONN_ID ; "conn id")]
fn missing_feature_is_a_handshake_error(key: &str) {
    let mut features = remote_features();
    features.remove(key);
    assert!(matches!(
        RemoteIntro::parse(&features),
        Err(MeshError::Handshake(_))
    ));
}

#[test]
fn flavour_mismatch_is_rejected() {
    let mut features = remote_features();
    features.insert(FEATURE_PEER_NAME_FLAVOUR.to_string(), "hash".to_string());
    let err = RemoteIntro::parse(&features).expect_err("mismatch");
    assert!(err.to_string().contains("flavour mismatch"));
}

#[test_case(FEATURE_UID, "-1" ; "negative uid")]
#[test_case(FEATURE_CONN_ID, "abc" ; "non numeric conn id")]
#[test_case(FEATURE_NAME, "zz:00" ; "bad name")]
fn malformed_feature_is_rejected(key: &str, value: &str) {
    let mut features = remote_features();
    features.insert(key.to_string(), value.to_string());
    assert!(RemoteIntro::parse(&features).is_err());
}

// ========== Handle Tests ==========

#[test]
fn summary_reflects_handle() {
    let (conn, _msgs, _errors) = handle(9);
    let summary = conn.summary();
    assert_eq!(summary.id, 9);
    assert_eq!(summary.remote, name(2));
    assert_eq!(summary.address, "10.0.0.2:6783");
    assert!(summary.outbound);
    assert!(!conn.is_established());
}

#[tokio::test]
async fn try_send_reports_full_queue() {
    let (conn, mut msgs, _errors) = handle(1);
    for _ in 0..CHANNEL_SIZE {
        conn.try_send_protocol_msg(ProtocolMsg::heartbeat())
            .expect("queue has room");
    }
    assert!(matches!(
        conn.try_send_protocol_msg(ProtocolMsg::heartbeat()),
        Err(MeshError::Connection(_))
    ));
    assert!(msgs.recv().await.is_some());
}

#[tokio::test]
async fn try_send_reports_closed_queue() {
    let (conn, msgs, _errors) = handle(1);
    drop(msgs);
    assert!(matches!(
        conn.try_send_protocol_msg(ProtocolMsg::heartbeat()),
        Err(MeshError::Shutdown(_))
    ));
}

#[tokio::test]
async fn send_is_abandoned_once_finished() {
    let (conn, _msgs, _errors) = handle(1);
    for _ in 0..CHANNEL_SIZE {
        conn.try_send_protocol_msg(ProtocolMsg::heartbeat())
            .expect("queue has room");
    }
    conn.finished.cancel();
    assert!(conn.is_finished());
    let sent = conn.send_protocol_msg(ProtocolMsg::heartbeat()).await;
    assert!(matches!(sent, Err(MeshError::Shutdown(_))));
}

#[tokio::test]
async fn first_shutdown_reason_wins() {
    let (conn, _msgs, mut errors) = handle(1);
    conn.shutdown(MeshError::ConnectToSelf);
    conn.shutdown(MeshError::HeartbeatTimeout("TCP"));
    assert!(matches!(errors.recv().await, Some(MeshError::ConnectToSelf)));
    assert!(errors.try_recv().is_err());
}

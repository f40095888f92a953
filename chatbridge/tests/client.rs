//! End-to-end tests through the safe client.

use std::sync::Mutex;
use std::time::Duration;

use chatbridge::{BridgeConfig, Client, Error};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn start_delivers_snapshot_then_follow_ups() {
    let mut client = Client::new().unwrap();
    let events = client.start().unwrap();

    let snapshot: Vec<_> = (0..4)
        .map(|_| events.recv_timeout(WAIT).unwrap().command)
        .collect();
    assert_eq!(
        snapshot,
        ["client_state", "sync_status", "sync_complete", "init_complete"]
    );

    let sent = client
        .submit_with_id("send_message", 9, br#"{"room_id":"!a","text":"hi"}"#)
        .unwrap();
    assert_eq!(sent.command(), "send_message");
    let body: serde_json::Value = serde_json::from_slice(sent.data()).unwrap();
    assert_eq!(body["room_id"], "!a");

    let follow_up = events.recv_timeout(WAIT).unwrap();
    assert_eq!((follow_up.command, follow_up.request_id), ("send_complete", 9));
}

#[test]
fn second_start_is_rejected_but_first_keeps_delivering() {
    let mut client = Client::new().unwrap();
    let events = client.start().unwrap();
    match client.start() {
        Err(Error::Start { code, message }) => {
            assert_eq!(code, 2);
            assert_eq!(message, "instance already started");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(events.recv_timeout(WAIT).is_some());
}

#[test]
fn commands_before_start_fail() {
    let client = Client::new().unwrap();
    let resp = client.submit("ping", b"{}").unwrap();
    assert!(resp.is_error());
    assert!(matches!(resp.into_result(), Err(Error::Command(m)) if m == "instance is not running"));
}

#[test]
fn nul_in_command_name_is_an_argument_error() {
    let client = Client::new().unwrap();
    assert!(matches!(
        client.submit("pi\0ng", b""),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn drop_ends_the_subscription() {
    let mut client = Client::new().unwrap();
    let events = client.start().unwrap();
    drop(client);
    // Whatever was queued drains, then the channel reports closed.
    while events.recv_timeout(WAIT).is_some() {}
    assert!(events.try_recv().is_none());
}

#[test]
fn uploads_report_progress() {
    let mut client = Client::new().unwrap();
    let _events = client.start().unwrap();

    let seen = Mutex::new(Vec::new());
    let resp = client.upload_media_bytes(br#"{"filename":"x.bin"}"#, &[0u8; 200_000], |p| {
        seen.lock().unwrap().push(p);
    });
    let body: serde_json::Value = serde_json::from_slice(resp.data()).unwrap();
    assert_eq!(resp.command(), "upload_media");
    assert_eq!(body["size"], 200_000);
    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.last(), Some(&100.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    let empty = client.upload_media_bytes(br#"{"filename":"e.bin"}"#, &[], |_| {});
    let body: serde_json::Value = serde_json::from_slice(empty.data()).unwrap();
    assert_eq!(body["size"], 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"hello").unwrap();
    let params = serde_json::to_vec(&serde_json::json!({ "path": path })).unwrap();
    let from_disk = client.upload_media_path(&params, |_| {});
    let body: serde_json::Value = serde_json::from_slice(from_disk.data()).unwrap();
    assert_eq!(body["filename"], "notes.txt");
    assert_eq!(body["size"], 5);

    let missing = client.upload_media_path(br#"{}"#, |_| {});
    assert!(missing.is_error());
}

#[test]
fn configure_after_first_use_is_rejected() {
    let _client = Client::new().unwrap();
    assert!(chatbridge::configure(BridgeConfig::default()).is_err());
}

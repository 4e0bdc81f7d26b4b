use std::io::Write;

use chatsync_client::persist::{IdentityStore, MAX_SESSION_FILE_BYTES, load_session_from_path};
use chatsync_core::Identity;
use chrono::{TimeZone, Utc};

fn identity(id: &str) -> Identity {
    Identity {
        id: id.to_owned(),
        display_name: "Ada Lovelace".to_owned(),
        avatar_ref: Some("https://cdn.example/ada.png".to_owned()),
        email: Some("ada@example.com".to_owned()),
        created_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap(),
    }
}

#[test]
fn saved_identity_survives_reload() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = IdentityStore::at(dir.path().join("nested").join("session.json"));

    store.save(&identity("u1")).expect("save identity");
    let reloaded = IdentityStore::at(store.path().unwrap()).load().expect("load");
    assert_eq!(reloaded, Some(identity("u1")));

    store.clear().expect("clear");
    assert_eq!(store.load().expect("load after clear"), None);
}

#[test]
fn missing_file_and_repeated_clear_are_not_errors() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = IdentityStore::at(dir.path().join("session.json"));

    assert_eq!(store.load().expect("load missing"), None);
    store.clear().expect("clear missing");
    store.clear().expect("clear missing twice");
}

#[test]
fn load_rejects_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("session.json");

    let mut file = std::fs::File::create(&path).expect("create session.json");
    file.write_all(&vec![b'a'; (MAX_SESSION_FILE_BYTES as usize) + 1024])
        .expect("write oversized session.json");
    drop(file);

    let err = load_session_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn corrupted_file_is_reported_not_trusted() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("session.json");
    std::fs::write(&path, b"{\"identity\": {\"_id\": ").expect("write corrupted file");

    let err = IdentityStore::at(&path)
        .load()
        .expect_err("corrupted file should error");
    assert!(err.to_string().contains("parse failed"), "unexpected error: {err}");
}

#[test]
fn ephemeral_store_keeps_nothing() {
    let store = IdentityStore::ephemeral();
    store.save(&identity("u1")).expect("save is a no-op");
    assert_eq!(store.load().expect("load"), None);
}

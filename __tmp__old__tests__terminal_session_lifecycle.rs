//! End-to-end tests against a real spawned shell: session creation, attach
//! contention, replay, and idle sweeping.

use std::path::PathBuf;
use std::time::Duration;
use termbroker::{PeerId, Session, SessionManager, SessionState, Signal, SpawnSpec};

fn shell_spec() -> SpawnSpec {
    SpawnSpec::new("/bin/sh", PathBuf::from(std::env::temp_dir()))
}

#[tokio::test]
async fn session_spawns_and_starts_in_starting_state() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    assert_eq!(session.state().await, SessionState::Starting);
    session.request_close("test").await;
}

#[tokio::test]
async fn echoed_input_appears_in_replay_buffer() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    session.pty().write(b"echo hello_world\n").await.unwrap();

    let mut found = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(data) = session.pty().read().await {
            session.append_output(&data).await;
        }
        if String::from_utf8_lossy(&session.snapshot_buffer().await).contains("hello_world") {
            found = true;
            break;
        }
    }
    assert!(found, "expected echoed output in replay buffer");
    session.request_close("test").await;
}

#[tokio::test]
async fn second_attach_is_rejected_until_first_detaches() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    let a = PeerId::new();
    let b = PeerId::new();

    let _cancel_a = session.attach(a).await.unwrap();
    assert!(session.attach(b).await.is_err());

    session.detach(a).await;
    let _cancel_b = session.attach(b).await.unwrap();
    assert_eq!(session.current_peer().await, Some(b));

    session.request_close("test").await;
}

#[tokio::test]
async fn force_detach_wakes_the_previous_attachment() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    let a = PeerId::new();
    let b = PeerId::new();

    let cancel_a = session.attach(a).await.unwrap();
    session.force_detach().await;

    let woke = tokio::time::timeout(Duration::from_millis(200), cancel_a.notified())
        .await
        .is_ok();
    assert!(woke, "previous attachment's cancel signal should fire on takeover");

    let cancel_b = session.attach(b).await.unwrap();
    assert_eq!(session.current_peer().await, Some(b));
    drop(cancel_b);
    session.request_close("test").await;
}

#[tokio::test]
async fn sigint_reaches_the_child_process_group() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    session
        .pty()
        .write(b"trap 'echo caught_sigint' INT; sleep 5\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    session.pty().signal(Signal::Sigint).unwrap();

    let mut caught = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Ok(data) = session.pty().read().await {
            session.append_output(&data).await;
        }
        if String::from_utf8_lossy(&session.snapshot_buffer().await).contains("caught_sigint") {
            caught = true;
            break;
        }
    }
    assert!(caught, "expected the child's SIGINT trap to fire");
    session.request_close("test").await;
}

#[tokio::test]
async fn request_close_terminates_the_child_and_is_idempotent() {
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    session.request_close("first").await;
    session.request_close("second").await;
    assert_eq!(session.state().await, SessionState::Closed);
}

#[tokio::test]
async fn manager_reuses_session_for_same_workspace_key() {
    let manager = SessionManager::new(4096, Duration::from_secs(1));
    let s1 = manager.get_or_create("workspace-a", &shell_spec()).await.unwrap();
    let s2 = manager.get_or_create("workspace-a", &shell_spec()).await.unwrap();
    assert_eq!(s1.id(), s2.id());
    s1.request_close("test").await;
}

#[tokio::test]
async fn manager_spawns_independent_sessions_per_key() {
    let manager = SessionManager::new(4096, Duration::from_secs(1));
    let s1 = manager.get_or_create("workspace-a", &shell_spec()).await.unwrap();
    let s2 = manager.get_or_create("workspace-b", &shell_spec()).await.unwrap();
    assert_ne!(s1.id(), s2.id());
    s1.request_close("test").await;
    s2.request_close("test").await;
}

#[tokio::test]
async fn concurrent_get_or_create_for_same_key_single_flights() {
    let manager = SessionManager::new(4096, Duration::from_secs(1));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.get_or_create("shared", &shell_spec()).await.unwrap().id().to_string()
        }));
    }

    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    let first = ids[0].clone();
    assert!(ids.iter().all(|id| *id == first), "single-flight should yield one session");

    manager.lookup("shared").await.unwrap().request_close("test").await;
}

#[tokio::test]
async fn spawn_latency_is_reasonable() {
    let start = std::time::Instant::now();
    let session = Session::new("ws".into(), &shell_spec(), 4096, Duration::from_secs(1)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1), "spawn should complete quickly");
    session.request_close("test").await;
}


#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end host/guest behavior over a real Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ngrpc_config::{App, Config};
use ngrpc_host::{Departure, Guest, GuestError, GuestState, Host, HostError, HostEvent};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

fn socket_in(dir: &TempDir) -> PathBuf {
    dir.path().join(".ngrpc").join("ngrpc.sock")
}

fn app(name: &str) -> App {
    App::new(name, "grpc://localhost:4000")
}

fn guest(name: &str, path: &Path) -> (Guest, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let guest = Guest::new(&app(name), move |id| {
        let _ = tx.send(id);
    })
    .with_socket_path(path);
    (guest, rx)
}

async fn started_host(path: &Path) -> (Host, broadcast::Receiver<HostEvent>) {
    let host = Host::with_socket_path(Config::default(), path);
    let events = host.subscribe();
    host.start(false).await.unwrap();
    (host, events)
}

async fn next_event(events: &mut broadcast::Receiver<HostEvent>) -> HostEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for host event")
        .expect("host event channel closed")
}

async fn wait_disconnected(guest: &Guest) {
    let mut status = guest.watch_status();
    tokio::time::timeout(
        WAIT,
        status.wait_for(|s| s.departure == Some(Departure::Disconnected)),
    )
    .await
    .expect("timed out waiting for disconnect")
    .unwrap();
}

#[tokio::test]
async fn join_and_leave_update_the_registry() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, mut events) = started_host(&path).await;
    let (guest, _stops) = guest("example-server", &path);

    assert_eq!(guest.state(), GuestState::Idle);
    guest.join().await.unwrap();
    assert_eq!(guest.state(), GuestState::Joined);

    assert_eq!(
        next_event(&mut events).await,
        HostEvent::Joined {
            name: "example-server".to_owned(),
            uri: "grpc://localhost:4000".to_owned(),
        }
    );
    assert_eq!(host.client_count(), 1);
    assert!(host.is_connected("example-server"));
    assert_eq!(host.connected_apps(), vec!["example-server".to_owned()]);

    guest.leave("done", None).await;
    assert_eq!(guest.state(), GuestState::Idle);
    assert_eq!(guest.status().departure, Some(Departure::Left));

    assert_eq!(
        next_event(&mut events).await,
        HostEvent::Left {
            name: "example-server".to_owned(),
            reason: "done".to_owned(),
            correlation_id: None,
        }
    );
    assert_eq!(host.client_count(), 0);

    host.stop().await;
}

#[tokio::test]
async fn join_returns_after_the_host_registered_the_app() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, _events) = started_host(&path).await;

    for round in 0..20 {
        let (guest, mut stops) = guest("example-server", &path);
        guest.join().await.unwrap();

        assert_eq!(host.client_count(), 1, "round {round}");
        host.dispatch("example-server", "right-away").unwrap();
        let id = tokio::time::timeout(WAIT, stops.recv())
            .await
            .expect("timed out waiting for stop")
            .unwrap();
        assert_eq!(id, "right-away");

        guest.leave("stopped", Some(&id)).await;
    }

    host.stop().await;
}

#[tokio::test]
async fn silent_connection_is_closed_after_the_handshake_timeout() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let host = Host::with_socket_path(Config::default(), &path)
        .with_handshake_timeout(Duration::from_millis(100));
    host.start(false).await.unwrap();

    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("host kept the silent connection open")
        .unwrap();

    assert_eq!(read, 0);
    assert_eq!(host.client_count(), 0);
    host.stop().await;
}

#[tokio::test]
async fn join_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, _events) = started_host(&path).await;
    let (guest, _stops) = guest("example-server", &path);

    guest.join().await.unwrap();
    let err = guest.join().await.unwrap_err();
    assert!(matches!(err, GuestError::AlreadyJoined { .. }));
    assert_eq!(err.to_string(), "app [example-server] has already joined");

    guest.leave("", None).await;
    guest.leave("", None).await;
    assert_eq!(guest.state(), GuestState::Idle);

    host.stop().await;
}

#[tokio::test]
async fn failed_join_removes_stale_socket_file() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"").unwrap();
    let (guest, _stops) = guest("example-server", &path);

    let err = guest.join().await.unwrap_err();

    assert!(matches!(err, GuestError::HostUnavailable { .. }));
    assert!(!path.exists());
    assert_eq!(guest.state(), GuestState::Idle);
}

#[tokio::test]
async fn dispatch_reaches_on_stop_and_leave_echoes_the_id() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, mut events) = started_host(&path).await;
    let (guest, mut stops) = guest("user-server", &path);

    guest.join().await.unwrap();
    next_event(&mut events).await;

    host.dispatch("user-server", "stop-1").unwrap();
    let received = tokio::time::timeout(WAIT, stops.recv()).await.unwrap();
    assert_eq!(received.as_deref(), Some("stop-1"));
    assert_eq!(guest.state(), GuestState::Joined);

    guest.leave("stopped", Some("stop-1")).await;
    assert_eq!(
        next_event(&mut events).await,
        HostEvent::Left {
            name: "user-server".to_owned(),
            reason: "stopped".to_owned(),
            correlation_id: Some("stop-1".to_owned()),
        }
    );

    let err = host.dispatch("user-server", "stop-2").unwrap_err();
    assert!(matches!(err, HostError::NotConnected { .. }));

    host.stop().await;
}

#[tokio::test]
async fn dispatch_all_stops_every_guest() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, mut events) = started_host(&path).await;
    let (a, mut a_stops) = guest("a", &path);
    let (b, mut b_stops) = guest("b", &path);

    a.join().await.unwrap();
    b.join().await.unwrap();
    next_event(&mut events).await;
    next_event(&mut events).await;

    let sent = host.dispatch_all();
    assert_eq!(sent.len(), 2);

    for (name, id) in sent {
        let stops = if name == "a" {
            &mut a_stops
        } else {
            &mut b_stops
        };
        let received = tokio::time::timeout(WAIT, stops.recv()).await.unwrap();
        assert_eq!(received, Some(id));
    }

    host.stop().await;
}

#[tokio::test]
async fn rejoin_replaces_previous_connection() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, mut events) = started_host(&path).await;
    let (first, mut first_stops) = guest("post-server", &path);
    let (second, mut second_stops) = guest("post-server", &path);

    first.join().await.unwrap();
    next_event(&mut events).await;
    second.join().await.unwrap();
    next_event(&mut events).await;

    wait_disconnected(&first).await;
    assert_eq!(first.state(), GuestState::Idle);
    assert_eq!(host.client_count(), 1);

    host.dispatch("post-server", "stop-new").unwrap();
    let received = tokio::time::timeout(WAIT, second_stops.recv()).await.unwrap();
    assert_eq!(received.as_deref(), Some("stop-new"));
    assert!(first_stops.try_recv().is_err());

    host.stop().await;
}

#[tokio::test]
async fn host_stop_disconnects_guests() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, mut events) = started_host(&path).await;
    let (guest, _stops) = guest("example-server", &path);

    guest.join().await.unwrap();
    next_event(&mut events).await;

    host.stop().await;
    assert!(!path.exists());
    assert_eq!(host.client_count(), 0);

    wait_disconnected(&guest).await;
    assert_eq!(guest.state(), GuestState::Idle);

    // leaving after the host is gone only resets local state
    guest.leave("late", None).await;
    assert_eq!(guest.status().departure, Some(Departure::Disconnected));
}

#[tokio::test]
async fn guest_rejoins_after_host_restart() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, _events) = started_host(&path).await;
    let (guest, _stops) = guest("example-server", &path);

    guest.join().await.unwrap();
    host.stop().await;
    wait_disconnected(&guest).await;

    let mut events = host.subscribe();
    host.start(true).await.unwrap();
    guest.join().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        HostEvent::Joined { .. }
    ));

    host.stop().await;
}

#[tokio::test]
async fn start_refuses_a_live_socket() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    let (host, _events) = started_host(&path).await;

    let other = Host::with_socket_path(Config::default(), &path);
    let err = other.start(false).await.unwrap_err();

    assert!(matches!(err, HostError::AddressInUse { .. }));
    assert!(path.exists());
    assert!(host.is_running());
    assert!(!other.is_running());

    host.stop().await;
}

#[tokio::test]
async fn start_reclaims_a_stale_socket_file() {
    let dir = TempDir::new().unwrap();
    let path = socket_in(&dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"leftover").unwrap();

    let (host, mut events) = started_host(&path).await;
    let (guest, _stops) = guest("example-server", &path);
    guest.join().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        HostEvent::Joined { .. }
    ));

    host.stop().await;
}

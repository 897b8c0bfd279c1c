//! Host side of the control socket.
//!
//! The host owns the listening socket and a registry of joined guests keyed by app
//! name. Every connection runs on its own task; stop commands reach it through a
//! per-connection channel so callers of [`Host::dispatch`] never touch the socket.
//!
//! A connection that opens with `stop-apps` instead of `join` is a controller: the
//! host dispatches the stop on its behalf and writes back one `stopped` line per app
//! as the answers come in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ngrpc_config::Config;
use parking_lot::RwLock;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::codec::{ControlCodec, ControlMessage, StopOutcome, StopReply};
use crate::error::HostError;
use crate::paths::get_socket_path;

const EVENT_CAPACITY: usize = 256;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long a new connection may take to send its first message.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ControlFramed = Framed<UnixStream, ControlCodec>;

/// Registry changes observed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Joined {
        name: String,
        uri: String,
    },
    /// The guest sent `Leave`. `correlation_id` echoes the stop command it answers.
    Left {
        name: String,
        reason: String,
        correlation_id: Option<String>,
    },
    /// The connection closed without a `Leave`.
    Disconnected {
        name: String,
    },
}

struct ClientHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<ControlMessage>,
    cancel: CancellationToken,
}

type ClientMap = HashMap<String, ClientHandle>;

struct Shared {
    clients: RwLock<ClientMap>,
    events: broadcast::Sender<HostEvent>,
    next_conn_id: AtomicU64,
}

impl Shared {
    /// Remove `name` only if the entry still belongs to connection `conn_id`.
    fn release(&self, name: &str, conn_id: u64) -> bool {
        let mut clients = self.clients.write();
        if clients.get(name).is_some_and(|c| c.conn_id == conn_id) {
            clients.remove(name);
            true
        } else {
            false
        }
    }

    fn emit(&self, event: HostEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn dispatch(&self, name: &str, correlation_id: &str) -> Result<(), HostError> {
        let clients = self.clients.read();
        let not_connected = || HostError::NotConnected {
            app: name.to_owned(),
        };

        let client = clients.get(name).ok_or_else(not_connected)?;
        client
            .tx
            .send(ControlMessage::Stop {
                correlation_id: correlation_id.to_owned(),
            })
            .map_err(|_| not_connected())?;

        tracing::debug!(app = %name, correlation_id, "stop dispatched");
        Ok(())
    }

    fn dispatch_all(&self) -> Vec<(String, String)> {
        self.connected_apps()
            .into_iter()
            .filter_map(|name| {
                let id = new_correlation_id();
                match self.dispatch(&name, &id) {
                    Ok(()) => Some((name, id)),
                    Err(e) => {
                        tracing::debug!(app = %name, error = %e, "skipping stop");
                        None
                    }
                }
            })
            .collect()
    }

    fn connected_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    connections: TaskTracker,
}

/// The host registry.
pub struct Host {
    config: Config,
    socket_path: PathBuf,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    listening: AtomicBool,
}

impl Host {
    /// Create a host listening on the per-user socket path.
    ///
    /// # Errors
    /// Returns [`HostError::Path`] if the socket path cannot be resolved.
    pub fn new(config: Config) -> Result<Self, HostError> {
        Ok(Self::with_socket_path(config, get_socket_path()?))
    }

    /// Create a host listening on an explicit socket path.
    pub fn with_socket_path(config: Config, socket_path: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            socket_path: socket_path.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            shared: Arc::new(Shared {
                clients: RwLock::new(HashMap::new()),
                events,
                next_conn_id: AtomicU64::new(1),
            }),
            running: Mutex::new(None),
            listening: AtomicBool::new(false),
        }
    }

    /// Close connections that send nothing within `timeout` of being accepted.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Bind the control socket and start accepting guests.
    ///
    /// A leftover socket file nobody listens on is removed first.
    ///
    /// # Errors
    /// - [`HostError::AlreadyStarted`] if this host is running
    /// - [`HostError::AddressInUse`] if another host listens on the path
    /// - [`HostError::Prepare`] / [`HostError::Bind`] on filesystem or bind failures
    pub async fn start(&self, verbose: bool) -> Result<(), HostError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(HostError::AlreadyStarted);
        }

        let path = self.socket_path.clone();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HostError::Prepare {
                path: path.clone(),
                source,
            })?;
        }
        reclaim_socket_path(&path).await?;

        let listener = UnixListener::bind(&path).map_err(|source| HostError::Bind {
            path: path.clone(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            cancel.clone(),
            connections.clone(),
            self.handshake_timeout,
        ));

        *running = Some(Running {
            cancel,
            accept_task,
            connections,
        });
        self.listening.store(true, Ordering::Release);

        if verbose {
            tracing::info!(path = %path.display(), "ngrpc host started");
        } else {
            tracing::debug!(path = %path.display(), "ngrpc host started");
        }
        Ok(())
    }

    /// Close the listener and every guest connection, then remove the socket file.
    /// Calling it on a stopped host does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.listening.store(false, Ordering::Release);

        running.cancel.cancel();
        self.shared.clients.write().clear();

        if let Err(e) = running.accept_task.await {
            tracing::warn!(error = %e, "host accept loop ended abnormally");
        }
        running.connections.close();
        running.connections.wait().await;

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %self.socket_path.display(),
                    error = %e,
                    "failed to remove control socket"
                );
            }
        }

        tracing::info!(path = %self.socket_path.display(), "ngrpc host stopped");
    }

    /// Ask the guest registered as `name` to stop.
    ///
    /// Returns once the command is queued for the guest's connection; the guest's
    /// answer arrives later as [`HostEvent::Left`].
    ///
    /// # Errors
    /// Returns [`HostError::NotConnected`] if no guest is registered under `name` or
    /// its connection is already closing.
    pub fn dispatch(&self, name: &str, correlation_id: &str) -> Result<(), HostError> {
        self.shared.dispatch(name, correlation_id)
    }

    /// Ask every joined guest to stop. Returns `(app, correlation id)` for each
    /// command that was queued.
    pub fn dispatch_all(&self) -> Vec<(String, String)> {
        self.shared.dispatch_all()
    }

    #[must_use]
    pub fn new_correlation_id() -> String {
        new_correlation_id()
    }

    /// Names of joined guests, sorted.
    #[must_use]
    pub fn connected_apps(&self) -> Vec<String> {
        self.shared.connected_apps()
    }

    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.shared.clients.read().contains_key(name)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    /// Subscribe to registry changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// Make `path` bindable: refuse if a live host answers on it, otherwise remove
/// whatever file is left there.
async fn reclaim_socket_path(path: &Path) -> Result<(), HostError> {
    if !path.exists() {
        return Ok(());
    }

    if UnixStream::connect(path).await.is_ok() {
        return Err(HostError::AddressInUse {
            path: path.to_path_buf(),
        });
    }

    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HostError::Prepare {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    connections: TaskTracker,
    handshake_timeout: Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(
                        stream,
                        Arc::clone(&shared),
                        cancel.child_token(),
                        handshake_timeout,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept guest connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("host accept loop exited");
}

async fn serve_connection(
    stream: UnixStream,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handshake_timeout: Duration,
) {
    let mut framed = Framed::new(stream, ControlCodec::new());

    let first = tokio::select! {
        () = cancel.cancelled() => return,
        frame = tokio::time::timeout(handshake_timeout, framed.next()) => frame,
    };
    match first {
        Ok(Some(Ok(ControlMessage::Join { name, uri }))) => {
            serve_guest(framed, &shared, &cancel, name, uri).await;
        }
        Ok(Some(Ok(ControlMessage::StopApps { app }))) => {
            relay_stop(framed, &shared, &cancel, app).await;
        }
        Ok(Some(Ok(other))) => {
            tracing::warn!(message = ?other, "control connection did not start with join");
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(error = %e, "failed to read first control message");
        }
        Ok(None) => {}
        Err(_) => {
            tracing::warn!(timeout = ?handshake_timeout, "control connection sent nothing, closing");
        }
    }
}

async fn serve_guest(
    mut framed: ControlFramed,
    shared: &Shared,
    cancel: &CancellationToken,
    name: String,
    uri: String,
) {
    let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let superseded = shared.clients.write().insert(
        name.clone(),
        ClientHandle {
            conn_id,
            tx,
            cancel: cancel.clone(),
        },
    );
    if let Some(previous) = superseded {
        tracing::info!(app = %name, "app rejoined, closing previous connection");
        previous.cancel.cancel();
    }

    // Guest::join waits for this, so the entry is visible once join returns
    if let Err(e) = framed.send(ControlMessage::Accepted).await {
        tracing::warn!(app = %name, error = %e, "failed to acknowledge join");
        shared.release(&name, conn_id);
        return;
    }

    tracing::info!(app = %name, uri = %uri, "app joined");
    shared.emit(HostEvent::Joined {
        name: name.clone(),
        uri,
    });

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                shared.release(&name, conn_id);
                return;
            }
            Some(outbound) = rx.recv() => {
                if let Err(e) = framed.send(outbound).await {
                    tracing::warn!(app = %name, error = %e, "failed to write to guest");
                    disconnect(shared, &name, conn_id);
                    return;
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(ControlMessage::Leave { reason, correlation_id, .. })) => {
                    if shared.release(&name, conn_id) {
                        tracing::info!(app = %name, reason = %reason, "app left");
                        shared.emit(HostEvent::Left { name, reason, correlation_id });
                    }
                    return;
                }
                Some(Ok(other)) => {
                    tracing::debug!(app = %name, message = ?other, "ignoring unexpected control message");
                }
                Some(Err(e)) => {
                    tracing::warn!(app = %name, error = %e, "failed to read from guest");
                    disconnect(shared, &name, conn_id);
                    return;
                }
                None => {
                    disconnect(shared, &name, conn_id);
                    return;
                }
            },
        }
    }
}

/// Stop `app` (or every joined app) for a controller and report each answer.
/// The connection is closed once every dispatched app has answered.
async fn relay_stop(
    mut framed: ControlFramed,
    shared: &Shared,
    cancel: &CancellationToken,
    app: Option<String>,
) {
    // subscribe first so no answer slips through between dispatch and the wait
    let mut events = shared.events.subscribe();

    let mut pending: HashMap<String, String> = HashMap::new();
    match app {
        Some(name) => {
            let id = new_correlation_id();
            if let Err(e) = shared.dispatch(&name, &id) {
                tracing::info!(app = %name, error = %e, "remote stop of unknown app");
                let reply = StopReply {
                    app: name,
                    outcome: StopOutcome::NotConnected,
                    reason: String::new(),
                    correlation_id: None,
                };
                send_reply(&mut framed, reply).await;
                return;
            }
            pending.insert(name, id);
        }
        None => pending.extend(shared.dispatch_all()),
    }
    tracing::info!(apps = ?pending.keys().collect::<Vec<_>>(), "remote stop dispatched");

    while !pending.is_empty() {
        let reply = tokio::select! {
            () = cancel.cancelled() => return,
            frame = framed.next() => match frame {
                Some(Ok(other)) => {
                    tracing::debug!(message = ?other, "ignoring controller message");
                    continue;
                }
                Some(Err(_)) | None => {
                    tracing::debug!("controller went away before every app answered");
                    return;
                }
            },
            event = events.recv() => match event {
                Ok(HostEvent::Left { name, reason, correlation_id }) => {
                    if pending.remove(&name).is_none() {
                        continue;
                    }
                    StopReply {
                        app: name,
                        outcome: StopOutcome::Left,
                        reason,
                        correlation_id,
                    }
                }
                Ok(HostEvent::Disconnected { name }) => {
                    let Some(id) = pending.remove(&name) else {
                        continue;
                    };
                    StopReply {
                        app: name,
                        outcome: StopOutcome::Disconnected,
                        reason: String::new(),
                        correlation_id: Some(id),
                    }
                }
                Ok(HostEvent::Joined { .. }) => continue,
                Err(RecvError::Lagged(_)) => {
                    for reply in take_departed(shared, &mut pending) {
                        if !send_reply(&mut framed, reply).await {
                            return;
                        }
                    }
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        if !send_reply(&mut framed, reply).await {
            return;
        }
    }

    if let Err(e) = framed.close().await {
        tracing::debug!(error = %e, "failed to close controller connection");
    }
}

/// After missing events, every pending app that is no longer registered is
/// reported as disconnected.
fn take_departed(shared: &Shared, pending: &mut HashMap<String, String>) -> Vec<StopReply> {
    let clients = shared.clients.read();
    let gone: Vec<String> = pending
        .keys()
        .filter(|name| !clients.contains_key(*name))
        .cloned()
        .collect();
    gone.into_iter()
        .map(|name| {
            let correlation_id = pending.remove(&name);
            StopReply {
                app: name,
                outcome: StopOutcome::Disconnected,
                reason: String::new(),
                correlation_id,
            }
        })
        .collect()
}

async fn send_reply(framed: &mut ControlFramed, reply: StopReply) -> bool {
    match framed.send(ControlMessage::Stopped(reply)).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "failed to write to controller");
            false
        }
    }
}

fn disconnect(shared: &Shared, name: &str, conn_id: u64) {
    if shared.release(name, conn_id) {
        tracing::info!(app = %name, "app disconnected");
        shared.emit(HostEvent::Disconnected {
            name: name.to_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_to_unknown_app_is_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::with_socket_path(Config::default(), dir.path().join("ngrpc.sock"));

        let err = host.dispatch("ghost", "id-1").unwrap_err();
        assert_eq!(err.to_string(), "app [ghost] is not connected");
        assert!(host.dispatch_all().is_empty());
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ngrpc.sock");
        let host = Host::with_socket_path(Config::default(), &path);

        host.start(false).await.unwrap();
        assert!(host.is_running());
        assert!(path.exists());
        assert!(matches!(
            host.start(false).await,
            Err(HostError::AlreadyStarted)
        ));

        host.stop().await;
        assert!(!host.is_running());
        assert!(!path.exists());
        host.stop().await;
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(Host::new_correlation_id(), Host::new_correlation_id());
    }
}

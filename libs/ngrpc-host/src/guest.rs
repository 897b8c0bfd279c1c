//! Guest side of the control socket.
//!
//! A [`Guest`] joins the host under its app name, runs the stop callback for every
//! stop command it receives, and leaves when the owning process is done.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ngrpc_config::App;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{CodecError, ControlCodec, ControlMessage};
use crate::error::GuestError;
use crate::paths::get_socket_path;

/// How long [`Guest::join`] waits for the host to accept the connection, and
/// again for the host to acknowledge the join.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

type StopHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuestState {
    #[default]
    Idle,
    Joined,
}

/// What moved the guest back to [`GuestState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// [`Guest::leave`] was called.
    Left,
    /// The host closed the connection or it broke.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestStatus {
    pub state: GuestState,
    /// `None` until the first return to `Idle`.
    pub departure: Option<Departure>,
}

struct Session {
    writer: FramedWrite<OwnedWriteHalf, ControlCodec>,
    listener: JoinHandle<()>,
    epoch: u64,
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    epoch: u64,
}

pub struct Guest {
    app_name: String,
    app_uri: String,
    socket_path: Option<PathBuf>,
    on_stop: StopHandler,
    slot: Arc<Mutex<Slot>>,
    status: Arc<watch::Sender<GuestStatus>>,
}

impl Guest {
    /// Create an idle guest for `app`. `on_stop` runs with the correlation id of
    /// every stop command the host sends.
    pub fn new<F>(app: &App, on_stop: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            app_name: app.name.clone(),
            app_uri: app.uri.clone(),
            socket_path: None,
            on_stop: Arc::new(on_stop),
            slot: Arc::new(Mutex::new(Slot::default())),
            status: Arc::new(watch::Sender::new(GuestStatus::default())),
        }
    }

    /// Dial `path` instead of the per-user socket path.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    #[must_use]
    pub fn app_uri(&self) -> &str {
        &self.app_uri
    }

    #[must_use]
    pub fn state(&self) -> GuestState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn status(&self) -> GuestStatus {
        *self.status.borrow()
    }

    /// Receiver that sees every status transition.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<GuestStatus> {
        self.status.subscribe()
    }

    /// Connect to the host and register this app.
    ///
    /// Returns once the host has acknowledged the join, so the app is already in
    /// the host's registry.
    ///
    /// If the dial is refused while a file sits at the socket path, that file is a
    /// leftover from a dead host: it is removed and the dial error is still
    /// returned, so the next attempt can succeed.
    ///
    /// # Errors
    /// - [`GuestError::AlreadyJoined`] when called while joined
    /// - [`GuestError::Path`] when the socket path cannot be resolved
    /// - [`GuestError::HostUnavailable`] when the dial or the acknowledgement times out
    /// - [`GuestError::ConnectionLost`] when the join message cannot be written or
    ///   the host closes the connection instead of acknowledging it
    pub async fn join(&self) -> Result<(), GuestError> {
        let mut slot = self.slot.lock().await;
        if slot.session.is_some() {
            return Err(GuestError::AlreadyJoined {
                app: self.app_name.clone(),
            });
        }

        let path = match &self.socket_path {
            Some(path) => path.clone(),
            None => get_socket_path()?,
        };
        let stream = dial(&path).await?;
        let (read_half, write_half) = stream.into_split();

        let mut writer = FramedWrite::new(write_half, ControlCodec::new());
        writer
            .send(ControlMessage::Join {
                name: self.app_name.clone(),
                uri: self.app_uri.clone(),
            })
            .await
            .map_err(GuestError::ConnectionLost)?;

        let mut reader = FramedRead::new(read_half, ControlCodec::new());
        await_accepted(&mut reader, &path).await?;

        slot.epoch += 1;
        let epoch = slot.epoch;
        let listener = tokio::spawn(listen(
            reader,
            self.app_name.clone(),
            epoch,
            Arc::clone(&self.on_stop),
            Arc::clone(&self.slot),
            Arc::clone(&self.status),
        ));
        slot.session = Some(Session {
            writer,
            listener,
            epoch,
        });
        self.status.send_replace(GuestStatus {
            state: GuestState::Joined,
            departure: None,
        });

        tracing::info!(app = %self.app_name, path = %path.display(), "joined host");
        Ok(())
    }

    /// Tell the host this app is leaving and close the connection.
    ///
    /// `correlation_id` should echo the stop command being answered, if any. A
    /// failed write is logged; the guest is `Idle` afterwards either way. Does
    /// nothing when already idle.
    pub async fn leave(&self, reason: &str, correlation_id: Option<&str>) {
        let mut slot = self.slot.lock().await;
        let Some(mut session) = slot.session.take() else {
            return;
        };

        let leave = ControlMessage::Leave {
            name: self.app_name.clone(),
            reason: reason.to_owned(),
            correlation_id: correlation_id.map(str::to_owned),
        };
        if let Err(e) = session.writer.send(leave).await {
            tracing::warn!(app = %self.app_name, error = %e, "failed to send leave message");
        }
        if let Err(e) = session.writer.close().await {
            tracing::debug!(app = %self.app_name, error = %e, "failed to close control connection");
        }
        session.listener.abort();

        self.status.send_replace(GuestStatus {
            state: GuestState::Idle,
            departure: Some(Departure::Left),
        });
        tracing::info!(app = %self.app_name, reason, "left host");
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock()
            && let Some(session) = slot.session.take()
        {
            session.listener.abort();
        }
    }
}

async fn dial(path: &Path) -> Result<UnixStream, GuestError> {
    let unavailable = |source: std::io::Error| GuestError::HostUnavailable {
        path: path.to_path_buf(),
        source,
    };

    match tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            if e.kind() == std::io::ErrorKind::ConnectionRefused && path.exists() {
                remove_stale_socket(path);
            }
            Err(unavailable(e))
        }
        Err(_) => Err(unavailable(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out dialing host",
        ))),
    }
}

async fn await_accepted(
    reader: &mut FramedRead<OwnedReadHalf, ControlCodec>,
    path: &Path,
) -> Result<(), GuestError> {
    let lost = |kind, msg: String| {
        GuestError::ConnectionLost(CodecError::Io(std::io::Error::new(kind, msg)))
    };

    match tokio::time::timeout(DIAL_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(ControlMessage::Accepted))) => Ok(()),
        Ok(Some(Ok(other))) => Err(lost(
            std::io::ErrorKind::InvalidData,
            format!("expected join acknowledgement, got {other:?}"),
        )),
        Ok(Some(Err(e))) => Err(GuestError::ConnectionLost(e)),
        Ok(None) => Err(lost(
            std::io::ErrorKind::UnexpectedEof,
            "host closed the connection during join".to_owned(),
        )),
        Err(_) => Err(GuestError::HostUnavailable {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for host to accept join",
            ),
        }),
    }
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale control socket");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove stale control socket"
            );
        }
    }
}

async fn listen(
    mut reader: FramedRead<OwnedReadHalf, ControlCodec>,
    app: String,
    epoch: u64,
    on_stop: StopHandler,
    slot: Arc<Mutex<Slot>>,
    status: Arc<watch::Sender<GuestStatus>>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(ControlMessage::Stop { correlation_id }) => {
                tracing::debug!(app = %app, correlation_id = %correlation_id, "stop requested");
                on_stop(correlation_id);
            }
            Ok(other) => {
                tracing::debug!(app = %app, message = ?other, "ignoring unexpected control message");
            }
            Err(e) => {
                tracing::warn!(app = %app, error = %e, "failed to read from host");
                break;
            }
        }
    }

    let mut slot = slot.lock().await;
    if slot.session.as_ref().is_some_and(|s| s.epoch == epoch) {
        slot.session = None;
        status.send_replace(GuestStatus {
            state: GuestState::Idle,
            departure: Some(Departure::Disconnected),
        });
        tracing::info!(app = %app, "connection to host lost");
    }
}

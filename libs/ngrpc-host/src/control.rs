//! Controller side of the control socket.
//!
//! A controller is a short-lived connection that asks a running host to stop one
//! app, or all of them, and collects each app's answer.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::codec::{ControlCodec, ControlMessage, StopReply};
use crate::error::ControlError;
use crate::guest::DIAL_TIMEOUT;

/// Ask the host listening on `socket_path` to stop `app`, or every joined app when
/// `app` is `None`.
///
/// Resolves once every dispatched app has left or disconnected. An unknown `app`
/// yields a single [`StopOutcome::NotConnected`](crate::codec::StopOutcome) reply;
/// stopping everything while nothing is joined yields no replies.
///
/// # Errors
/// - [`ControlError::HostUnavailable`] when the socket cannot be dialed
/// - [`ControlError::Connection`] when the connection breaks mid-exchange
pub async fn request_stop(
    socket_path: &Path,
    app: Option<&str>,
) -> Result<Vec<StopReply>, ControlError> {
    let unavailable = |source: std::io::Error| ControlError::HostUnavailable {
        path: socket_path.to_path_buf(),
        source,
    };
    let stream = tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .map_err(|_| {
            unavailable(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out dialing host",
            ))
        })?
        .map_err(unavailable)?;

    let mut framed = Framed::new(stream, ControlCodec::new());
    framed
        .send(ControlMessage::StopApps {
            app: app.map(str::to_owned),
        })
        .await
        .map_err(ControlError::Connection)?;
    tracing::debug!(app = app.unwrap_or("*"), "stop requested from host");

    let mut replies = Vec::new();
    while let Some(frame) = framed.next().await {
        match frame.map_err(ControlError::Connection)? {
            ControlMessage::Stopped(reply) => {
                tracing::debug!(app = %reply.app, outcome = ?reply.outcome, "app answered stop");
                replies.push(reply);
            }
            other => {
                tracing::debug!(message = ?other, "ignoring unexpected control message");
            }
        }
    }
    Ok(replies)
}

use std::path::PathBuf;

use crate::codec::CodecError;
use crate::paths::PathError;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("host is already started")]
    AlreadyStarted,

    #[error("control socket {} is in use by another host", path.display())]
    AddressInUse { path: PathBuf },

    #[error("unable to prepare control socket {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to bind control socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("app [{app}] is not connected")]
    NotConnected { app: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("app [{app}] has already joined")]
    AlreadyJoined { app: String },

    /// The host could not be dialed: not running, stale socket, or the dial timed out.
    #[error("unable to reach host at {}: {source}", path.display())]
    HostUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to host lost: {0}")]
    ConnectionLost(#[source] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unable to reach host at {}: {source}", path.display())]
    HostUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control connection failed: {0}")]
    Connection(#[source] CodecError),
}

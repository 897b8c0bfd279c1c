#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! Host/guest supervision over a local Unix domain socket.
//!
//! A single [`Host`] per machine listens on `$HOME/.ngrpc/ngrpc.sock`. App
//! processes create a [`Guest`], join the host under their app name, and leave
//! when they stop. The host can ask any joined app to stop; the app answers by
//! leaving with the same correlation id. Other processes can ask the host for the
//! same thing with [`request_stop`].

pub mod codec;
pub mod control;
pub mod error;
pub mod guest;
pub mod host;
pub mod paths;

pub use codec::{
    CodecError, ControlCodec, ControlMessage, MAX_LINE_LENGTH, StopOutcome, StopReply,
};
pub use control::request_stop;
pub use error::{ControlError, GuestError, HostError};
pub use guest::{DIAL_TIMEOUT, Departure, Guest, GuestState, GuestStatus};
pub use host::{HANDSHAKE_TIMEOUT, Host, HostEvent};
pub use paths::{PathError, get_socket_path, socket_path_in};

//! Where the control socket lives.
//!
//! Host and guests must agree on the socket path without talking to each other,
//! so it is derived from `$HOME` alone: `$HOME/.ngrpc/ngrpc.sock`.

use std::env;
use std::path::{Path, PathBuf};

pub const HOME_SUBDIR: &str = ".ngrpc";
pub const SOCKET_FILE: &str = "ngrpc.sock";

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("HOME environment variable is not set")]
    HomeMissing,
}

/// Path of the control socket for the current user.
///
/// # Errors
/// Returns [`PathError::HomeMissing`] if `HOME` is not set.
pub fn get_socket_path() -> Result<PathBuf, PathError> {
    let home = env::var_os("HOME").ok_or(PathError::HomeMissing)?;
    Ok(socket_path_in(Path::new(&home)))
}

/// Path of the control socket under an explicit home directory.
#[must_use]
pub fn socket_path_in(home: &Path) -> PathBuf {
    home.join(HOME_SUBDIR).join(SOCKET_FILE)
}

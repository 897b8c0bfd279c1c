#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! App configuration for ngrpc.
//!
//! - [`model`]: the `App`/`Config` descriptors read from `ngrpc.json`
//! - [`loader`]: locating and parsing the config file (with local override)
//! - [`address`]: turning an app URI into a `host:port` dial address
//! - [`credentials`]: plaintext or mutual-TLS transport credentials per app
//! - [`client`]: handing address + credentials to `tonic`

pub mod address;
pub mod client;
pub mod credentials;
pub mod error;
pub mod loader;
pub mod model;

pub use address::{GRPC_SCHEME, GRPCS_SCHEME, default_port, get_address, parse_app_uri};
pub use client::{DialTarget, GrpcClientConfig, build_endpoint, connect_app, connect_app_lazy, dial_target};
pub use credentials::{Credentials, SecurityMode, TlsField, get_credentials};
pub use error::ConfigError;
pub use loader::{CONFIG_FILE, LOCAL_CONFIG_FILE, load_config, load_config_from};
pub use model::{App, Config};

//! App and config descriptors.
//!
//! These mirror the JSON layout of `ngrpc.json`:
//!
//! ```json
//! {
//!     "entry": "entry/main",
//!     "apps": [
//!         { "name": "user-server", "uri": "grpcs://localhost:4001", "serve": true,
//!           "ca": "certs/ca.pem", "cert": "certs/cert.pem", "key": "certs/cert.key" }
//!     ]
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single app declared in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct App {
    /// Unique, non-empty app name.
    pub name: String,
    /// `grpc://host[:port]` or `grpcs://host[:port]`.
    pub uri: String,
    /// Whether this app serves gRPC itself (as opposed to being a pure client).
    pub serve: bool,
    /// Path to the CA certificate used for `grpcs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// Path to the client/server certificate used for `grpcs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,
    /// Path to the private key used for `grpcs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Entry point that launches this app; overrides [`Config::entry`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Extra environment variables handed to the launched guest.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl App {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tls(
        mut self,
        ca: impl Into<String>,
        cert: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.ca = Some(ca.into());
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default entry point for apps that don't set their own.
    pub entry: String,
    /// Declared apps, in file order.
    pub apps: Vec<App>,
}

impl Config {
    /// Look up an app by name.
    #[must_use]
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Apps that serve gRPC and therefore run as guests of the host.
    pub fn served_apps(&self) -> impl Iterator<Item = &App> {
        self.apps.iter().filter(|app| app.serve)
    }

    /// Entry point of `app`, falling back to the config-wide entry.
    #[must_use]
    pub fn entry_of<'a>(&'a self, app: &'a App) -> &'a str {
        app.entry.as_deref().unwrap_or(&self.entry)
    }
}

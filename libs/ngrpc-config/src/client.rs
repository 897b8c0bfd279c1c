//! Dialing ngrpc apps over gRPC.
//!
//! Resolves an [`App`] into a [`DialTarget`] (address + credentials) and builds a
//! `tonic` channel for it with configurable timeouts and HTTP/2 keepalive.

use std::time::Duration;

use anyhow::Context;
use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

use crate::address::{get_address, parse_app_uri};
use crate::credentials::{Credentials, get_credentials};
use crate::error::ConfigError;
use crate::model::App;

fn duration_to_i64_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Everything needed to open a channel to an app.
#[derive(Debug, Clone)]
pub struct DialTarget {
    /// `host:port`.
    pub address: String,
    pub credentials: Credentials,
}

/// Resolve the dial target of `app`.
///
/// # Errors
/// Propagates URI validation and credential errors.
pub fn dial_target(app: &App) -> Result<DialTarget, ConfigError> {
    let url = parse_app_uri(app)?;
    let address = get_address(&url);
    let credentials = get_credentials(app, &url)?;
    Ok(DialTarget {
        address,
        credentials,
    })
}

/// Transport settings for app channels.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the initial connection.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls (applied at transport level).
    pub rpc_timeout: Duration,

    /// TCP and HTTP/2 keepalive interval.
    pub keepalive: Duration,

    /// How long to wait for a keepalive ping ack.
    pub keepalive_timeout: Duration,

    /// Log connection details at info level.
    pub enable_tracing: bool,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            enable_tracing: true,
        }
    }
}

impl GrpcClientConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    #[must_use]
    pub fn without_tracing(mut self) -> Self {
        self.enable_tracing = false;
        self
    }
}

/// Build a `tonic` endpoint for `target`.
///
/// Plaintext targets use `http://`, TLS targets `https://` with the client TLS
/// config attached.
///
/// # Errors
/// Returns a transport error if the address does not form a valid URI or the
/// TLS config is rejected.
pub fn build_endpoint(
    target: &DialTarget,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let uri = match target.credentials {
        Credentials::Insecure => format!("http://{}", target.address),
        Credentials::Tls(_) => format!("https://{}", target.address),
    };

    let mut endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(cfg.keepalive))
        .http2_keep_alive_interval(cfg.keepalive)
        .keep_alive_timeout(cfg.keepalive_timeout)
        .keep_alive_while_idle(true);

    if let Credentials::Tls(tls) = &target.credentials {
        endpoint = endpoint.tls_config((**tls).clone())?;
    }

    Ok(endpoint)
}

/// Connect to `app` and return a ready channel.
///
/// # Errors
/// Fails if the app cannot be resolved or the connection cannot be established.
pub async fn connect_app(app: &App, cfg: &GrpcClientConfig) -> anyhow::Result<Channel> {
    let target = dial_target(app)?;
    let span = tracing::debug_span!(
        "grpc_connect",
        app = %app.name,
        address = %target.address,
        mode = %target.credentials.mode()
    );

    async move {
        let endpoint = build_endpoint(&target, cfg)
            .with_context(|| format!("invalid endpoint for app [{}]", app.name))?;
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("unable to connect to app [{}]", app.name))?;

        if cfg.enable_tracing {
            tracing::info!(
                app = %app.name,
                connect_timeout_ms = duration_to_i64_ms(cfg.connect_timeout),
                rpc_timeout_ms = duration_to_i64_ms(cfg.rpc_timeout),
                "gRPC client connected"
            );
        }

        Ok(channel)
    }
    .instrument(span)
    .await
}

/// Build a channel to `app` that connects on first use.
///
/// # Errors
/// Fails if the app cannot be resolved into a valid endpoint.
pub fn connect_app_lazy(app: &App, cfg: &GrpcClientConfig) -> anyhow::Result<Channel> {
    let target = dial_target(app)?;
    let endpoint = build_endpoint(&target, cfg)
        .with_context(|| format!("invalid endpoint for app [{}]", app.name))?;
    Ok(endpoint.connect_lazy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = GrpcClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
        assert!(cfg.enable_tracing);
    }

    #[test]
    fn config_builder() {
        let cfg = GrpcClientConfig::default()
            .with_connect_timeout(Duration::from_secs(5))
            .with_rpc_timeout(Duration::from_secs(15))
            .with_keepalive(Duration::from_secs(60))
            .without_tracing();

        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(15));
        assert_eq!(cfg.keepalive, Duration::from_secs(60));
        assert!(!cfg.enable_tracing);
    }

    #[test]
    fn plaintext_target_uses_http() {
        let app = App::new("example-server", "grpc://localhost:4000");
        let target = dial_target(&app).unwrap();
        assert_eq!(target.address, "localhost:4000");

        let endpoint = build_endpoint(&target, &GrpcClientConfig::default()).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().authority().unwrap().as_str(), "localhost:4000");
    }

    #[test]
    fn dial_target_rejects_bad_scheme() {
        let app = App::new("web", "https://localhost");
        assert!(matches!(
            dial_target(&app),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[tokio::test]
    async fn lazy_channel_builds_without_server() {
        let app = App::new("example-server", "grpc://127.0.0.1:1");
        assert!(connect_app_lazy(&app, &GrpcClientConfig::default()).is_ok());
    }
}

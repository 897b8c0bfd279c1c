use url::Url;

use crate::error::ConfigError;
use crate::model::App;

pub const GRPC_SCHEME: &str = "grpc";
pub const GRPCS_SCHEME: &str = "grpcs";

/// Port assumed when an app URI doesn't carry one.
#[must_use]
pub fn default_port(scheme: &str) -> u16 {
    if scheme == GRPCS_SCHEME { 443 } else { 80 }
}

/// Resolve the `host:port` address to dial for an app URI.
///
/// An explicit port is kept as-is; otherwise `grpcs` gets 443 and anything else 80.
#[must_use]
pub fn get_address(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port().unwrap_or_else(|| default_port(url.scheme()));
    format!("{host}:{port}")
}

/// Parse and validate the URI of an app.
///
/// # Errors
/// Fails when the URI doesn't parse, has no host, or uses a scheme other than
/// `grpc`/`grpcs`.
pub fn parse_app_uri(app: &App) -> Result<Url, ConfigError> {
    let url = Url::parse(&app.uri).map_err(|source| ConfigError::InvalidUri {
        app: app.name.clone(),
        uri: app.uri.clone(),
        source,
    })?;

    if url.scheme() != GRPC_SCHEME && url.scheme() != GRPCS_SCHEME {
        return Err(ConfigError::UnsupportedScheme {
            app: app.name.clone(),
            scheme: url.scheme().to_owned(),
        });
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::MissingHost {
            app: app.name.clone(),
            uri: app.uri.clone(),
        });
    }

    Ok(url)
}

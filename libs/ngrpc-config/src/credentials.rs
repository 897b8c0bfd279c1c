//! Transport credentials per app.
//!
//! `grpc://` apps talk plaintext. `grpcs://` apps use mutual TLS and must name a
//! CA certificate, a certificate and a private key; the files are read on every
//! call so rotated material is picked up without a restart.

use std::fmt;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use url::Url;

use crate::address::GRPCS_SCHEME;
use crate::error::ConfigError;
use crate::model::App;

/// TLS material fields of an [`App`], in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsField {
    Ca,
    Cert,
    Key,
}

impl fmt::Display for TlsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TlsField::Ca => "Ca",
            TlsField::Cert => "Cert",
            TlsField::Key => "Key",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    Insecure,
    Tls,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityMode::Insecure => "insecure",
            SecurityMode::Tls => "tls",
        })
    }
}

/// Credentials handed to the gRPC channel.
#[derive(Debug, Clone)]
pub enum Credentials {
    Insecure,
    Tls(Box<ClientTlsConfig>),
}

impl Credentials {
    #[must_use]
    pub fn mode(&self) -> SecurityMode {
        match self {
            Credentials::Insecure => SecurityMode::Insecure,
            Credentials::Tls(_) => SecurityMode::Tls,
        }
    }
}

/// Build the transport credentials for `app`, dialed at `url`.
///
/// The security mode depends on the URI scheme only: `grpcs` yields TLS, anything
/// else plaintext without touching the filesystem.
///
/// # Errors
/// For `grpcs`:
/// - [`ConfigError::MissingTlsField`] for the first of `ca`, `cert`, `key` that is
///   absent or empty
/// - [`ConfigError::ReadFile`] when a file cannot be read
/// - [`ConfigError::CertPool`] when the CA file holds no usable certificate
/// - [`ConfigError::KeyPair`] when the certificate or key cannot be parsed
pub fn get_credentials(app: &App, url: &Url) -> Result<Credentials, ConfigError> {
    if url.scheme() != GRPCS_SCHEME {
        return Ok(Credentials::Insecure);
    }

    let ca_path = required(app, TlsField::Ca, app.ca.as_deref())?;
    let cert_path = required(app, TlsField::Cert, app.cert.as_deref())?;
    let key_path = required(app, TlsField::Key, app.key.as_deref())?;

    let ca_pem = read_file(ca_path)?;
    check_cert_pool(ca_path, &ca_pem)?;

    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;
    check_key_pair(cert_path, key_path, &cert_pem, &key_pem)?;

    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca_pem))
        .identity(Identity::from_pem(cert_pem, key_pem));

    tracing::debug!(app = %app.name, ca = ca_path, cert = cert_path, "Loaded TLS credentials");

    Ok(Credentials::Tls(Box::new(tls)))
}

fn required<'a>(app: &App, field: TlsField, value: Option<&'a str>) -> Result<&'a str, ConfigError> {
    match value {
        Some(path) if !path.is_empty() => Ok(path),
        _ => Err(ConfigError::MissingTlsField {
            field,
            app: app.name.clone(),
        }),
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_owned(),
        source,
    })
}

fn check_cert_pool(path: &str, pem: &[u8]) -> Result<(), ConfigError> {
    let pool_error = || ConfigError::CertPool {
        path: path.to_owned(),
    };

    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| pool_error())?;

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(path, added, ignored, "some CA certificates could not be parsed");
    }
    if added == 0 {
        return Err(pool_error());
    }
    Ok(())
}

fn check_key_pair(
    cert_path: &str,
    key_path: &str,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(), ConfigError> {
    let key_pair_error = |reason: String| ConfigError::KeyPair {
        cert: cert_path.to_owned(),
        key: key_path.to_owned(),
        reason,
    };

    let certs = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| key_pair_error(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(key_pair_error("no certificate found".to_owned()));
    }

    PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| key_pair_error(format!("failed to parse private key: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(uri: &str) -> Url {
        Url::parse(uri).unwrap()
    }

    #[test]
    fn plaintext_never_touches_files() {
        let app = App::new("example-server", "grpc://localhost:4000").with_tls(
            "/definitely/not/here/ca.pem",
            "/definitely/not/here/cert.pem",
            "/definitely/not/here/cert.key",
        );

        let creds = get_credentials(&app, &url(&app.uri)).unwrap();
        assert_eq!(creds.mode(), SecurityMode::Insecure);
        assert_eq!(creds.mode().to_string(), "insecure");
    }

    #[test]
    fn missing_fields_reported_in_order() {
        let uri = url("grpcs://localhost:4001");
        let mut app = App::new("user-server", uri.as_str());

        let err = get_credentials(&app, &uri).unwrap_err();
        assert_eq!(err.to_string(), "missing 'Ca' config for app [user-server]");

        app.ca = Some("./certs/ca.pem".to_owned());
        let err = get_credentials(&app, &uri).unwrap_err();
        assert_eq!(err.to_string(), "missing 'Cert' config for app [user-server]");

        app.cert = Some("./certs/cert.pem".to_owned());
        app.key = Some(String::new());
        let err = get_credentials(&app, &uri).unwrap_err();
        assert_eq!(err.to_string(), "missing 'Key' config for app [user-server]");
    }

    #[test]
    fn unreadable_ca_names_the_path() {
        let uri = url("grpcs://localhost:4001");
        let app = App::new("user-server", uri.as_str()).with_tls(
            "./certs/ca.pem",
            "./certs/cert.pem",
            "./certs/cert.key",
        );

        let err = get_credentials(&app, &uri).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
        assert!(
            err.to_string().starts_with("open ./certs/ca.pem: "),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn security_mode_display() {
        assert_eq!(SecurityMode::Tls.to_string(), "tls");
        assert_eq!(TlsField::Cert.to_string(), "Cert");
    }
}

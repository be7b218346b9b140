//! TLS material loading for the worker's mTLS endpoint.
//!
//! The server and the CLI client both authenticate with a certificate signed
//! by a shared CA. On the server side the client certificate is mandatory;
//! its subject common name becomes the caller identity (see [`crate::auth`]).

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Server name the client expects in the worker's certificate.
pub const DEFAULT_SERVER_NAME: &str = "jobworker-server";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Certificate, key and trusted CA for one side of an mTLS connection.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Load TLS materials from the paths in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is not configured, or a file does not exist
    /// or cannot be read.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        let ca_pem = read_pem(ca_cert_path, TlsError::CaCertNotFound).await?;
        let cert_pem = read_pem(cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_pem(key_path, TlsError::KeyNotFound).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server config that requires and verifies a client certificate.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client config presenting this identity and trusting only the CA.
    ///
    /// `domain` must match a name in the server certificate.
    pub fn client_tls_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

async fn read_pem(
    path: &Path,
    not_found: fn(PathBuf) -> TlsError,
) -> Result<Vec<u8>, TlsError> {
    if !path.exists() {
        return Err(not_found(path.to_path_buf()));
    }
    Ok(fs::read(path).await?)
}

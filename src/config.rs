use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Per-job execution and streaming settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Time between SIGTERM and SIGKILL when a job is stopped
    pub kill_grace_period_ms: u64,
    /// Number of log lines buffered per open log stream
    pub stream_buffer: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            kill_grace_period_ms: 2000,
            stream_buffer: 32,
        }
    }
}

impl JobConfig {
    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_millis(self.kill_grace_period_ms)
    }
}

/// TLS configuration for the worker's gRPC endpoint.
///
/// When enabled, the server uses mutual TLS (mTLS):
/// - The server presents its certificate to clients
/// - Clients must present a certificate signed by the configured CA
/// - The client certificate's subject common name becomes the caller identity
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify peer certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this side's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this side's private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    /// When false and TLS files are missing, fails to start.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub job: JobConfig,
    /// Identity assigned to every caller when running without TLS.
    /// Only honoured in insecure mode; `None` rejects all plaintext callers.
    pub insecure_identity: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50005)),
            job: JobConfig::default(),
            insecure_identity: None,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_insecure_identity(mut self, identity: impl Into<String>) -> Self {
        self.insecure_identity = Some(identity.into());
        self
    }
}

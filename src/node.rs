use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::job::JobRegistry;
use crate::tls::TlsIdentity;

/// A worker host: the job registry plus the gRPC endpoint serving it.
pub struct Node {
    pub config: ServerConfig,
    pub registry: Arc<JobRegistry>,
    tls_identity: Option<TlsIdentity>,
}

impl Node {
    pub fn new(config: ServerConfig, tls_identity: Option<TlsIdentity>) -> Self {
        Self {
            config,
            registry: Arc::new(JobRegistry::new()),
            tls_identity,
        }
    }

    /// Serve until `shutdown` is cancelled, then stop every running job so
    /// no child process outlives the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server cannot bind or fails while serving.
    /// Running jobs are stopped either way.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let server = GrpcServer::new(
            self.config.listen_addr,
            Arc::clone(&self.registry),
            self.config.job.clone(),
            self.tls_identity,
        )
        .with_insecure_identity(self.config.insecure_identity.clone());

        let result = server.run(shutdown).await;

        let stopped = self.registry.stop_all().await;
        tracing::info!(stopped, "Worker shut down");
        result
    }
}

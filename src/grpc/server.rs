use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::auth::Authenticator;
use crate::config::JobConfig;
use crate::error::Result;
use crate::grpc::worker_service::WorkerServiceImpl;
use crate::job::JobRegistry;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::tls::TlsIdentity;

pub struct GrpcServer {
    addr: SocketAddr,
    registry: Arc<JobRegistry>,
    job_config: JobConfig,
    tls_identity: Option<TlsIdentity>,
    insecure_identity: Option<String>,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        registry: Arc<JobRegistry>,
        job_config: JobConfig,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        Self {
            addr,
            registry,
            job_config,
            tls_identity,
            insecure_identity: None,
        }
    }

    /// Identity given to plaintext callers. Ignored when TLS is configured.
    pub fn with_insecure_identity(mut self, identity: Option<String>) -> Self {
        self.insecure_identity = identity;
        self
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let tls_enabled = self.tls_identity.is_some();

        let insecure_identity = if tls_enabled {
            None
        } else {
            self.insecure_identity
        };
        let authenticator = Authenticator::new(insecure_identity);
        let service =
            WorkerServiceImpl::with_shutdown(self.registry, self.job_config, shutdown.clone());

        let mut builder = Server::builder();
        if let Some(ref tls_identity) = self.tls_identity {
            builder = builder.tls_config(tls_identity.server_tls_config())?;
        }

        tracing::info!(addr = %local_addr, tls_enabled, "Starting gRPC server");

        builder
            .add_service(WorkerServiceServer::with_interceptor(service, authenticator))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}

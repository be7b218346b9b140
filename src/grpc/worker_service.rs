use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::auth::{owner_from_request, Owner};
use crate::config::JobConfig;
use crate::error::WorkerError;
use crate::job::{Job, JobId, JobRegistry, JobStatus, Subscription};
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    JobInfo, JobListRequest, JobListResponse, JobLogRequest, JobLogResponse, JobQueryRequest,
    JobQueryResponse, JobStartRequest, JobState, JobStopRequest, JobStopResponse,
};

/// Response header carrying the id of a job created by `JobStart`.
pub const JOB_ID_HEADER: &str = "x-job-id";

type LogStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<JobLogResponse, Status>> + Send>>;

/// gRPC service for the client-facing job API.
///
/// Every handler first resolves the caller's [`Owner`]; all job lookups are
/// scoped to it.
pub struct WorkerServiceImpl {
    registry: Arc<JobRegistry>,
    job_config: JobConfig,
    shutdown: CancellationToken,
}

impl WorkerServiceImpl {
    pub fn new(registry: Arc<JobRegistry>, job_config: JobConfig) -> Self {
        Self::with_shutdown(registry, job_config, CancellationToken::new())
    }

    /// Like [`new`](Self::new), but open log streams end when `shutdown` is
    /// cancelled so the server can drain.
    pub fn with_shutdown(
        registry: Arc<JobRegistry>,
        job_config: JobConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            job_config,
            shutdown,
        }
    }

    async fn resolve_job(&self, owner: &Owner, raw_id: &str) -> Result<Arc<Job>, WorkerError> {
        let job_id = parse_job_id(raw_id)?;
        self.registry.find_job(owner, &job_id).await
    }

    /// Forward a subscription into a bounded per-stream channel.
    ///
    /// The forwarding task ends when the job's output is exhausted, the
    /// client goes away, or the server shuts down. Dropping the subscription
    /// detaches it from the job's hub.
    fn log_stream(&self, job_id: JobId, mut subscription: Subscription) -> LogStream {
        let (tx, rx) = tokio::sync::mpsc::channel(self.job_config.stream_buffer.max(1));
        let shutdown = self.shutdown.clone();
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            tracing::debug!(job_id = %job_id, "Log subscriber attached");
            loop {
                let line = tokio::select! {
                    _ = tx.closed() => {
                        tracing::debug!(job_id = %job_id, "Log subscriber disconnected");
                        break;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!(job_id = %job_id, "Ending log stream for shutdown");
                        break;
                    }
                    line = subscription.recv() => line,
                };

                let Some(log_line) = line else {
                    tracing::debug!(
                        job_id = %job_id,
                        lines = subscription.position(),
                        "Log stream complete"
                    );
                    break;
                };

                let response = JobLogResponse {
                    job_id: job_id.clone(),
                    log_line,
                };
                // A client that stops reading must not pin the subscription.
                tokio::select! {
                    sent = tx.send(Ok(response)) => {
                        if sent.is_err() {
                            tracing::debug!(job_id = %job_id, "Log subscriber disconnected");
                            break;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!(job_id = %job_id, "Ending log stream for shutdown");
                        break;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    type JobStartStream = LogStream;
    type JobLogStream = LogStream;

    async fn job_start(
        &self,
        request: Request<JobStartRequest>,
    ) -> Result<Response<Self::JobStartStream>, Status> {
        let owner = owner_from_request(&request)?;
        let req = request.into_inner();

        let job = Job::new(owner, req.command, &self.job_config)?;
        let job_id = job.id();

        // Subscribe before starting so the caller sees the very first line.
        let subscription = job.subscribe();
        self.registry.add_job(Arc::clone(&job)).await;
        job.start()?;

        let mut response = Response::new(self.log_stream(job_id, subscription));
        let header = MetadataValue::try_from(job_id.to_string())
            .map_err(|e| Status::internal(format!("Invalid job ID header: {}", e)))?;
        response.metadata_mut().insert(JOB_ID_HEADER, header);
        Ok(response)
    }

    async fn job_stop(
        &self,
        request: Request<JobStopRequest>,
    ) -> Result<Response<JobStopResponse>, Status> {
        let owner = owner_from_request(&request)?;
        let req = request.into_inner();

        let job = self.resolve_job(&owner, &req.job_id).await?;
        if !job.stop() {
            tracing::debug!(job_id = %job.id(), status = %job.status(), "Stop ignored, job not running");
        }

        Ok(Response::new(JobStopResponse {}))
    }

    async fn job_query(
        &self,
        request: Request<JobQueryRequest>,
    ) -> Result<Response<JobQueryResponse>, Status> {
        let owner = owner_from_request(&request)?;
        let req = request.into_inner();

        let job = self.resolve_job(&owner, &req.job_id).await?;
        let status = job.status();

        Ok(Response::new(JobQueryResponse {
            job_id: job.id().to_string(),
            status: status.to_string(),
            state: status_to_proto(&status) as i32,
            exit_code: status.exit_code(),
            error: match &status {
                JobStatus::Failed(reason) => reason.clone(),
                _ => String::new(),
            },
            command: job.command().to_vec(),
            created_at_ms: job.created_at().timestamp_millis(),
            finished_at_ms: job.finished_at().map(|dt| dt.timestamp_millis()),
        }))
    }

    async fn job_log(
        &self,
        request: Request<JobLogRequest>,
    ) -> Result<Response<Self::JobLogStream>, Status> {
        let owner = owner_from_request(&request)?;
        let req = request.into_inner();

        let job = self.resolve_job(&owner, &req.job_id).await?;
        Ok(Response::new(self.log_stream(job.id(), job.subscribe())))
    }

    async fn job_list(
        &self,
        request: Request<JobListRequest>,
    ) -> Result<Response<JobListResponse>, Status> {
        let owner = owner_from_request(&request)?;

        let jobs = self
            .registry
            .jobs_for_owner(&owner)
            .await
            .iter()
            .map(|job| {
                let status = job.status();
                JobInfo {
                    job_id: job.id().to_string(),
                    command: job.command().to_vec(),
                    status: status.to_string(),
                    state: status_to_proto(&status) as i32,
                    created_at_ms: job.created_at().timestamp_millis(),
                }
            })
            .collect();

        Ok(Response::new(JobListResponse { jobs }))
    }
}

/// An id that does not parse can never name a job, so it is reported
/// exactly like an unknown one.
fn parse_job_id(raw: &str) -> Result<JobId, WorkerError> {
    Uuid::parse_str(raw.trim()).map_err(|_| WorkerError::JobNotFound(raw.to_string()))
}

pub fn status_to_proto(status: &JobStatus) -> JobState {
    match status {
        JobStatus::Pending => JobState::Pending,
        JobStatus::Running => JobState::Running,
        JobStatus::Stopped => JobState::Stopped,
        JobStatus::Exited(_) => JobState::Exited,
        JobStatus::Failed(_) => JobState::Failed,
    }
}

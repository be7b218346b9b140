//! Tests for the WorkerService handlers.
//!
//! Handlers are called directly with requests that already carry the
//! authenticated owner, the way the auth interceptor leaves them. These
//! tests verify:
//! - Start streams output and announces the job id
//! - Query, stop, log and list semantics
//! - Per-owner isolation and error codes
//! - Log streams end on server shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};
use uuid::Uuid;

use jobworker::auth::Owner;
use jobworker::config::JobConfig;
use jobworker::grpc::worker_service::JOB_ID_HEADER;
use jobworker::grpc::WorkerServiceImpl;
use jobworker::job::{JobRegistry, STOPPED_BY_USER_LINE};
use jobworker::proto::worker_service_server::WorkerService;
use jobworker::proto::{
    JobListRequest, JobLogRequest, JobLogResponse, JobQueryRequest, JobStartRequest, JobState,
    JobStopRequest,
};

fn service() -> (WorkerServiceImpl, Arc<JobRegistry>) {
    let registry = Arc::new(JobRegistry::new());
    let config = JobConfig {
        kill_grace_period_ms: 200,
        ..JobConfig::default()
    };
    (WorkerServiceImpl::new(Arc::clone(&registry), config), registry)
}

fn as_user<T>(user: &str, message: T) -> Request<T> {
    let mut request = Request::new(message);
    request.extensions_mut().insert(Owner::new(user));
    request
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn expect_err<T>(result: Result<T, Status>) -> Status {
    match result {
        Ok(_) => panic!("expected an error status"),
        Err(status) => status,
    }
}

fn header_job_id<T>(response: &Response<T>) -> String {
    response
        .metadata()
        .get(JOB_ID_HEADER)
        .expect("missing job id header")
        .to_str()
        .unwrap()
        .to_string()
}

async fn collect<S>(mut stream: S) -> Vec<JobLogResponse>
where
    S: Stream<Item = Result<JobLogResponse, Status>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(10), async move {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.expect("stream error"));
        }
        out
    })
    .await
    .expect("log stream did not end in time")
}

fn lines(responses: &[JobLogResponse]) -> Vec<String> {
    responses.iter().map(|r| r.log_line.clone()).collect()
}

// ============================================================================
// JobStart / JobQuery
// ============================================================================

#[tokio::test]
async fn test_start_streams_output_with_job_id() {
    let (svc, _registry) = service();

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: vec!["echo".to_string(), "hello world".to_string()],
            },
        ))
        .await
        .unwrap();
    let job_id = header_job_id(&response);
    assert!(Uuid::parse_str(&job_id).is_ok());

    let responses = collect(response.into_inner()).await;
    assert_eq!(lines(&responses), vec!["hello world".to_string()]);
    assert!(responses.iter().all(|r| r.job_id == job_id));

    let status = svc
        .job_query(as_user("alice", JobQueryRequest { job_id: job_id.clone() }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.job_id, job_id);
    assert_eq!(status.state, JobState::Exited as i32);
    assert_eq!(status.status, "exited(0)");
    assert_eq!(status.exit_code, Some(0));
    assert!(status.error.is_empty());
    assert_eq!(status.command, vec!["echo", "hello world"]);
    assert!(status.created_at_ms > 0);
    assert!(status.finished_at_ms.unwrap() >= status.created_at_ms);
}

#[tokio::test]
async fn test_start_with_empty_command_is_invalid() {
    let (svc, registry) = service();

    let status = expect_err(
        svc.job_start(as_user("alice", JobStartRequest { command: vec![] }))
            .await,
    );

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_start_of_missing_program_reports_failure() {
    let (svc, _registry) = service();

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: vec!["/nonexistent/program".to_string()],
            },
        ))
        .await
        .unwrap();
    let job_id = header_job_id(&response);
    assert!(collect(response.into_inner()).await.is_empty());

    let status = svc
        .job_query(as_user("alice", JobQueryRequest { job_id }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state, JobState::Failed as i32);
    assert_eq!(status.exit_code, None);
    assert!(status.error.contains("Failed to spawn process"));
}

#[tokio::test]
async fn test_malformed_id_is_not_found() {
    let (svc, _registry) = service();

    let query = expect_err(
        svc.job_query(as_user(
            "alice",
            JobQueryRequest {
                job_id: "not-a-uuid".to_string(),
            },
        ))
        .await,
    );
    let stop = expect_err(
        svc.job_stop(as_user(
            "alice",
            JobStopRequest {
                job_id: String::new(),
            },
        ))
        .await,
    );
    let log = expect_err(
        svc.job_log(as_user(
            "alice",
            JobLogRequest {
                job_id: "123".to_string(),
            },
        ))
        .await,
    );

    for status in [&query, &stop, &log] {
        assert_eq!(status.code(), Code::NotFound);
    }
    assert_eq!(query.message(), "Job not found: not-a-uuid");
}

#[tokio::test]
async fn test_request_without_identity_is_unauthenticated() {
    let (svc, _registry) = service();

    let status = expect_err(
        svc.job_start(Request::new(JobStartRequest {
            command: vec!["true".to_string()],
        }))
        .await,
    );
    assert_eq!(status.code(), Code::Unauthenticated);

    let status = expect_err(svc.job_list(Request::new(JobListRequest {})).await);
    assert_eq!(status.code(), Code::Unauthenticated);
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_other_users_cannot_see_jobs() {
    let (svc, _registry) = service();

    let response = svc
        .job_start(as_user("alice", JobStartRequest { command: sh("echo secret") }))
        .await
        .unwrap();
    let job_id = header_job_id(&response);
    collect(response.into_inner()).await;

    let query = expect_err(
        svc.job_query(as_user("bob", JobQueryRequest { job_id: job_id.clone() }))
            .await,
    );
    let stop = expect_err(
        svc.job_stop(as_user("bob", JobStopRequest { job_id: job_id.clone() }))
            .await,
    );
    let log = expect_err(
        svc.job_log(as_user("bob", JobLogRequest { job_id: job_id.clone() }))
            .await,
    );
    for status in [&query, &stop, &log] {
        assert_eq!(status.code(), Code::NotFound);
    }

    // Indistinguishable from an id that was never issued.
    let unknown_id = Uuid::new_v4().to_string();
    let unknown = expect_err(
        svc.job_query(as_user("alice", JobQueryRequest { job_id: unknown_id.clone() }))
            .await,
    );
    assert_eq!(unknown.code(), Code::NotFound);
    assert_eq!(
        query.message().replace(&job_id, "ID"),
        unknown.message().replace(&unknown_id, "ID")
    );

    // The owner still sees it.
    assert!(svc
        .job_query(as_user("alice", JobQueryRequest { job_id }))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_list_is_scoped_to_caller() {
    let (svc, _registry) = service();

    let mut alice_ids = Vec::new();
    for word in ["one", "two"] {
        let response = svc
            .job_start(as_user(
                "alice",
                JobStartRequest {
                    command: vec!["echo".to_string(), word.to_string()],
                },
            ))
            .await
            .unwrap();
        alice_ids.push(header_job_id(&response));
        collect(response.into_inner()).await;
    }

    let alice_jobs = svc
        .job_list(as_user("alice", JobListRequest {}))
        .await
        .unwrap()
        .into_inner()
        .jobs;
    let ids: Vec<String> = alice_jobs.iter().map(|j| j.job_id.clone()).collect();
    assert_eq!(ids, alice_ids);
    assert_eq!(alice_jobs[0].command, vec!["echo", "one"]);
    assert!(alice_jobs
        .iter()
        .all(|j| j.state == JobState::Exited as i32));

    let bob_jobs = svc
        .job_list(as_user("bob", JobListRequest {}))
        .await
        .unwrap()
        .into_inner()
        .jobs;
    assert!(bob_jobs.is_empty());
}

// ============================================================================
// JobLog / JobStop
// ============================================================================

#[tokio::test]
async fn test_concurrent_log_streams_are_identical() {
    let (svc, _registry) = service();

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: sh("for i in 1 2 3 4 5; do echo line $i; sleep 0.02; done"),
            },
        ))
        .await
        .unwrap();
    let job_id = header_job_id(&response);

    let first = svc
        .job_log(as_user("alice", JobLogRequest { job_id: job_id.clone() }))
        .await
        .unwrap()
        .into_inner();
    let second = svc
        .job_log(as_user("alice", JobLogRequest { job_id: job_id.clone() }))
        .await
        .unwrap()
        .into_inner();

    let (start_lines, first_lines, second_lines) = tokio::join!(
        collect(response.into_inner()),
        collect(first),
        collect(second)
    );

    let expected: Vec<String> = (1..=5).map(|i| format!("line {}", i)).collect();
    assert_eq!(lines(&start_lines), expected);
    assert_eq!(lines(&first_lines), expected);
    assert_eq!(lines(&second_lines), expected);

    // After completion a new stream replays everything and ends.
    let replay = svc
        .job_log(as_user("alice", JobLogRequest { job_id }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(lines(&collect(replay).await), expected);
}

#[tokio::test]
async fn test_stop_ends_streams_with_stop_line() {
    let (svc, _registry) = service();

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: sh("while true; do echo tick; sleep 0.05; done"),
            },
        ))
        .await
        .unwrap();
    let job_id = header_job_id(&response);
    let mut stream = response.into_inner();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no output from running job")
        .expect("stream ended early")
        .unwrap();
    assert_eq!(first.log_line, "tick");

    let status = svc
        .job_query(as_user("alice", JobQueryRequest { job_id: job_id.clone() }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state, JobState::Running as i32);
    assert_eq!(status.status, "running");
    assert_eq!(status.exit_code, None);
    assert!(status.finished_at_ms.is_none());

    svc.job_stop(as_user("alice", JobStopRequest { job_id: job_id.clone() }))
        .await
        .unwrap();

    let rest = collect(stream).await;
    assert_eq!(
        rest.last().map(|r| r.log_line.as_str()),
        Some(STOPPED_BY_USER_LINE)
    );

    let status = svc
        .job_query(as_user("alice", JobQueryRequest { job_id: job_id.clone() }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state, JobState::Stopped as i32);
    assert_eq!(status.exit_code, None);

    // Stopping again succeeds without changing anything.
    svc.job_stop(as_user("alice", JobStopRequest { job_id: job_id.clone() }))
        .await
        .unwrap();
    let status = svc
        .job_query(as_user("alice", JobQueryRequest { job_id }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.state, JobState::Stopped as i32);
}

#[tokio::test]
async fn test_shutdown_ends_open_log_streams() {
    let registry = Arc::new(JobRegistry::new());
    let shutdown = CancellationToken::new();
    let svc = WorkerServiceImpl::with_shutdown(
        Arc::clone(&registry),
        JobConfig {
            kill_grace_period_ms: 200,
            ..JobConfig::default()
        },
        shutdown.clone(),
    );

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: sh("while true; do echo tick; sleep 0.05; done"),
            },
        ))
        .await
        .unwrap();
    let mut stream = response.into_inner();
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no output from running job");

    shutdown.cancel();
    collect(stream).await;

    assert_eq!(registry.stop_all().await, 1);
    assert_eq!(registry.stop_all().await, 0);
}

#[tokio::test]
async fn test_shutdown_releases_stream_nobody_reads() {
    let registry = Arc::new(JobRegistry::new());
    let shutdown = CancellationToken::new();
    let svc = WorkerServiceImpl::with_shutdown(
        Arc::clone(&registry),
        JobConfig {
            stream_buffer: 1,
            ..JobConfig::default()
        },
        shutdown.clone(),
    );

    let response = svc
        .job_start(as_user(
            "alice",
            JobStartRequest {
                command: vec!["seq".to_string(), "1".to_string(), "100".to_string()],
            },
        ))
        .await
        .unwrap();
    let job_id = Uuid::parse_str(&header_job_id(&response)).unwrap();
    // Held but never read, so the forwarder fills its buffer and waits.
    let _stream = response.into_inner();

    let job = registry
        .find_job(&Owner::new("alice"), &job_id)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !job.status().is_terminal() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not finish");
    assert_eq!(job.log_hub().subscriber_count(), 1);

    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(5), async {
        while job.log_hub().subscriber_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("forwarder kept its subscription after shutdown");
}

use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::Streaming;
use tracing_subscriber::EnvFilter;

use jobworker::config::{JobConfig, ServerConfig, TlsConfig};
use jobworker::grpc::worker_service::JOB_ID_HEADER;
use jobworker::node::Node;
use jobworker::proto::worker_service_client::WorkerServiceClient;
use jobworker::proto::{
    JobListRequest, JobLogRequest, JobLogResponse, JobQueryRequest, JobStartRequest, JobState,
    JobStopRequest,
};
use jobworker::shutdown::install_shutdown_handler;
use jobworker::tls::{TlsIdentity, DEFAULT_SERVER_NAME};

#[derive(Parser, Debug)]
#[command(name = "jobworker")]
#[command(version)]
#[command(about = "Run, stop, query and tail jobs on a remote worker over mTLS")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50005")]
    port: u16,

    /// Milliseconds between SIGTERM and SIGKILL when stopping a job
    #[arg(long, default_value = "2000")]
    kill_grace_ms: u64,

    // === TLS Options ===
    /// Enable mutual TLS (required for per-user identities)
    #[arg(long)]
    tls: bool,

    /// Path to the CA certificate that signs client certificates (PEM)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to the server certificate (PEM)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to the server private key (PEM)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running without TLS when certificates are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,

    /// Identity assigned to every caller when running without TLS
    #[arg(long, requires = "allow_insecure")]
    insecure_identity: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address (use http:// for a plaintext development server)
    #[arg(long, short = 'a', default_value = "https://127.0.0.1:50005")]
    addr: String,

    /// User whose certificate is loaded from --cert-dir
    #[arg(long, short = 'u', default_value = "alice")]
    user: String,

    /// Directory holding ca.crt and <user>.crt / <user>.key
    #[arg(long, default_value = "certs")]
    cert_dir: PathBuf,

    /// CA certificate (PEM); overrides <cert-dir>/ca.crt
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate (PEM); overrides <cert-dir>/<user>.crt
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key (PEM); overrides <cert-dir>/<user>.key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Name expected in the server certificate
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    server_name: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Start a job and follow its output
    Start {
        /// Print the job ID and return without following output
        #[arg(long, short = 'd')]
        detach: bool,

        /// Program and arguments (e.g. -- ls -al)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Stop a running job
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Get status of a job
    Query {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Stream a job's output from the beginning
    Log {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List your jobs
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobStartOutput {
    job_id: String,
}

#[derive(Serialize)]
struct LogLineOutput {
    job_id: String,
    log_line: String,
}

#[derive(Serialize)]
struct JobQueryOutput {
    job_id: String,
    status: String,
    exit_code: Option<i32>,
    error: String,
    command: Vec<String>,
    created_at_ms: i64,
    finished_at_ms: Option<i64>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    status: String,
    command: Vec<String>,
    created_at_ms: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_state_to_string(state: i32) -> String {
    match JobState::try_from(state) {
        Ok(JobState::Pending) => "PENDING".to_string(),
        Ok(JobState::Running) => "RUNNING".to_string(),
        Ok(JobState::Stopped) => "STOPPED".to_string(),
        Ok(JobState::Exited) => "EXITED".to_string(),
        Ok(JobState::Failed) => "FAILED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

async fn create_client_channel(args: &ClientArgs) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = Channel::from_shared(args.addr.clone())?;

    if args.addr.starts_with("http://") {
        return Ok(endpoint.connect().await?);
    }

    let tls_config = TlsConfig {
        enabled: true,
        ca_cert_path: Some(
            args.ca_cert
                .clone()
                .unwrap_or_else(|| args.cert_dir.join("ca.crt")),
        ),
        cert_path: Some(
            args.cert
                .clone()
                .unwrap_or_else(|| args.cert_dir.join(format!("{}.crt", args.user))),
        ),
        key_path: Some(
            args.key
                .clone()
                .unwrap_or_else(|| args.cert_dir.join(format!("{}.key", args.user))),
        ),
        allow_insecure: false,
    };

    let identity = TlsIdentity::load(&tls_config).await?;
    Ok(endpoint
        .tls_config(identity.client_tls_config(&args.server_name))?
        .connect()
        .await?)
}

fn exit_with_status(action: &str, status: tonic::Status) -> ! {
    eprintln!("Error: {} failed: {}", action, status.message());
    std::process::exit(1);
}

async fn print_log_stream(
    mut stream: Streaming<JobLogResponse>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    while let Some(result) = stream.next().await {
        match result {
            Ok(entry) => match output_format {
                OutputFormat::Json => {
                    let output = LogLineOutput {
                        job_id: entry.job_id,
                        log_line: entry.log_line,
                    };
                    println!("{}", serde_json::to_string(&output)?);
                }
                OutputFormat::Table => println!("{}", entry.log_line),
            },
            Err(e) => {
                eprintln!("Stream error: {}", e.message());
                break;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tls_config = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        allow_insecure: args.allow_insecure,
    };

    let tls_identity = if tls_config.is_complete() {
        match TlsIdentity::load(&tls_config).await {
            Ok(identity) => {
                tracing::info!("TLS enabled with mTLS authentication");
                Some(identity)
            }
            Err(e) => {
                if tls_config.allow_insecure {
                    tracing::warn!(
                        error = %e,
                        "TLS certificate loading failed, running in insecure mode"
                    );
                    None
                } else {
                    return Err(format!("TLS certificate loading failed: {}", e).into());
                }
            }
        }
    } else if tls_config.enabled {
        if tls_config.allow_insecure {
            tracing::warn!(
                "TLS enabled but certificate paths incomplete, running in insecure mode"
            );
            None
        } else {
            return Err("TLS enabled but missing required paths (--ca-cert, --cert, --key)".into());
        }
    } else if tls_config.allow_insecure {
        tracing::warn!("Running without TLS. Consider using --tls for production deployments.");
        None
    } else {
        return Err(
            "Refusing to start without TLS: pass --tls with certificates, or --allow-insecure"
                .into(),
        );
    };

    if tls_identity.is_none() && args.insecure_identity.is_none() {
        tracing::warn!("No --insecure-identity set; plaintext callers will be rejected");
    }

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let config = ServerConfig {
        listen_addr,
        job: JobConfig {
            kill_grace_period_ms: args.kill_grace_ms,
            ..JobConfig::default()
        },
        insecure_identity: args.insecure_identity,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        tls_enabled = tls_identity.is_some(),
        "Starting jobworker"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config, tls_identity).run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_start(
    client: &mut WorkerServiceClient<Channel>,
    command: Vec<String>,
    detach: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client.job_start(JobStartRequest { command }).await {
        Ok(response) => response,
        Err(status) => exit_with_status("Job start", status),
    };

    let job_id = response
        .metadata()
        .get(JOB_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(&JobStartOutput { job_id })?);
        }
        OutputFormat::Table => {
            if detach {
                println!("{}", job_id);
            } else {
                eprintln!("Job ID: {}", job_id);
            }
        }
    }

    if detach {
        return Ok(());
    }
    print_log_stream(response.into_inner(), output_format).await
}

async fn handle_job_stop(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Err(status) = client.job_stop(JobStopRequest { job_id }).await {
        exit_with_status("Job stop", status);
    }
    Ok(())
}

async fn handle_job_query(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client.job_query(JobQueryRequest { job_id }).await {
        Ok(response) => response.into_inner(),
        Err(status) => exit_with_status("Job query", status),
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobQueryOutput {
                job_id: response.job_id,
                status: response.status,
                exit_code: response.exit_code,
                error: response.error,
                command: response.command,
                created_at_ms: response.created_at_ms,
                finished_at_ms: response.finished_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", response.job_id);
            println!("Status:    {}", job_state_to_string(response.state));
            println!("Command:   {}", response.command.join(" "));
            if let Some(exit_code) = response.exit_code {
                println!("Exit Code: {}", exit_code);
            }
            if !response.error.is_empty() {
                println!("Error:     {}", response.error);
            }
        }
    }
    Ok(())
}

async fn handle_job_log(
    client: &mut WorkerServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let stream = match client.job_log(JobLogRequest { job_id }).await {
        Ok(response) => response.into_inner(),
        Err(status) => exit_with_status("Job log", status),
    };
    print_log_stream(stream, output_format).await
}

async fn handle_job_list(
    client: &mut WorkerServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client.job_list(JobListRequest {}).await {
        Ok(response) => response.into_inner(),
        Err(status) => exit_with_status("Job list", status),
    };

    let jobs: Vec<JobListItem> = response
        .jobs
        .into_iter()
        .map(|job| JobListItem {
            job_id: job.job_id,
            status: job_state_to_string(job.state),
            command: job.command,
            created_at_ms: job.created_at_ms,
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<10} COMMAND", "JOB ID", "STATUS");
                println!("{}", "-".repeat(70));
                for job in &jobs {
                    let command = job.command.join(" ");
                    let cmd_display = if command.chars().count() > 30 {
                        format!("{}...", command.chars().take(27).collect::<String>())
                    } else {
                        command
                    };
                    println!("{:<38} {:<10} {}", job.job_id, job.status, cmd_display);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = create_client_channel(&client).await?;
            let mut grpc_client = WorkerServiceClient::new(channel);

            match command {
                JobCommands::Start { detach, command } => {
                    handle_job_start(&mut grpc_client, command, detach, &client.output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&mut grpc_client, job_id).await?;
                }
                JobCommands::Query { job_id } => {
                    handle_job_query(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Log { job_id } => {
                    handle_job_log(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::time::Duration;

use dotenv::dotenv;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use intake_worker_lib::cli::{guess_mime_type, parse_args, Command};
use intake_worker_lib::config::Config;
use intake_worker_lib::db::open_database;
use intake_worker_lib::logging::{format_error_report, init_logging};
use intake_worker_lib::queue::{ItemStatus, NewSubmission, QueueStore};
use intake_worker_lib::service::IntakeService;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    dotenv().ok();
    let cli = parse_args();

    let logging_context = init_logging("intake_worker", &cli.log_level);
    let run_span = tracing::info_span!(
        "worker_run",
        service = %logging_context.service,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }

    match cli.command {
        Command::Run {
            poll_interval_ms,
            extract_timeout_secs,
        } => {
            if let Some(ms) = poll_interval_ms {
                config.processor.poll_interval = Duration::from_millis(ms);
            }
            if let Some(secs) = extract_timeout_secs {
                config.processor.extract_timeout = Duration::from_secs(secs);
            }
            run_worker(config).await
        }
        Command::Enqueue { files } => enqueue_files(config, files).await,
        Command::Status => print_status(config).await,
        Command::List => print_list(config).await,
    }
}

/// Runs the worker until SIGTERM or SIGINT, then shuts down in order.
async fn run_worker(config: Config) -> i32 {
    let service = match IntakeService::init(config).await {
        Ok(service) => service,
        Err(err) => {
            let error_report = format_error_report(&err);
            error!(
                event = "service_init_failed",
                error = %err,
                error_report = %error_report,
                "failed to start intake worker service"
            );
            eprintln!("failed to start intake worker: {err}");
            eprintln!("{error_report}");
            return 1;
        }
    };

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {
            info!(event = "shutdown_signal", signal = "SIGTERM", "shutdown signal received");
        }
        _ = sigint.recv() => {
            info!(event = "shutdown_signal", signal = "SIGINT", "shutdown signal received");
        }
    }

    service.shutdown().await;
    0
}

/// Opens the queue store without starting a processor.
///
/// Used by one-shot subcommands; a concurrently running worker picks up
/// externally enqueued items on its next poll tick.
async fn open_standalone_store(config: &Config) -> Result<QueueStore, i32> {
    let conn = match open_database(&config.database_path) {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("failed to open queue database: {err}");
            eprintln!("{}", format_error_report(&err));
            return Err(1);
        }
    };

    // The receiver half is unused here; sends into a disconnected channel are
    // ignored by the store.
    let (wake_tx, _wake_rx) = flume::unbounded();
    match QueueStore::open(conn, wake_tx).await {
        Ok(store) => Ok(store),
        Err(err) => {
            eprintln!("failed to load queue state: {err}");
            eprintln!("{}", format_error_report(&err));
            Err(1)
        }
    }
}

async fn enqueue_files(config: Config, files: Vec<PathBuf>) -> i32 {
    let store = match open_standalone_store(&config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    let mut submissions = Vec::with_capacity(files.len());
    for path in &files {
        let payload = match std::fs::read(path) {
            Ok(payload) => payload,
            Err(err) => {
                eprintln!("failed to read {}: {err}", path.display());
                return 2;
            }
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = guess_mime_type(&file_name).to_string();
        submissions.push(NewSubmission {
            file_name,
            mime_type,
            payload,
        });
    }

    match store.enqueue_many(submissions).await {
        Ok(ids) => {
            for (path, id) in files.iter().zip(ids.iter()) {
                println!("{id}  {}", path.display());
            }
            info!(
                event = "cli_enqueue_complete",
                count = ids.len(),
                "enqueued files from the command line"
            );
            0
        }
        Err(err) => {
            eprintln!("{err}");
            for id in &err.persisted {
                println!("{id}  (persisted before the failure)");
            }
            1
        }
    }
}

async fn print_status(config: Config) -> i32 {
    let store = match open_standalone_store(&config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    let counts = store.counts().await;
    println!("pending:    {}", counts.pending);
    println!("processing: {}", counts.processing);
    println!("completed:  {}", counts.completed);
    println!("failed:     {}", counts.failed);
    println!("total:      {}", counts.total);
    0
}

async fn print_list(config: Config) -> i32 {
    let store = match open_standalone_store(&config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    for item in store.list().await {
        let detail = match item.status {
            ItemStatus::Failed => item.error.clone().unwrap_or_default(),
            ItemStatus::Completed => item
                .result
                .as_ref()
                .and_then(|record| record.document_kind.clone())
                .unwrap_or_default(),
            _ => String::new(),
        };
        println!(
            "{}  {:<10}  {}  {}  {}",
            item.id,
            item.status,
            item.enqueued_at.to_rfc3339(),
            item.file_name,
            detail
        );
    }
    0
}

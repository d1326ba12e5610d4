//! Command-line surface of the intake worker.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::build_info;

#[derive(Debug, Parser)]
#[command(
    name = "intake-worker",
    about = "Queue-backed document image extraction worker",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    /// Path to the durable queue database (overrides INTAKE_DB_PATH).
    #[arg(long = "database-path")]
    pub database_path: Option<String>,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker: recovery pass, then the extraction loop until signalled.
    Run {
        #[arg(long = "poll-interval-ms")]
        poll_interval_ms: Option<u64>,
        #[arg(long = "extract-timeout-secs")]
        extract_timeout_secs: Option<u64>,
    },
    /// Enqueue one or more document image files as pending items.
    Enqueue {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print per-status queue counts.
    Status,
    /// List every queue item in enqueue order.
    List,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Maps a file extension to the MIME type sent to extraction providers.
///
/// Unknown extensions fall back to `application/octet-stream`; providers
/// decide for themselves whether they can handle the payload.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses_with_overrides() {
        let cli = Cli::parse_from([
            "intake-worker",
            "--database-path",
            "/tmp/queue.db",
            "run",
            "--poll-interval-ms",
            "500",
        ]);

        assert_eq!(cli.database_path.as_deref(), Some("/tmp/queue.db"));
        match cli.command {
            Command::Run {
                poll_interval_ms,
                extract_timeout_secs,
            } => {
                assert_eq!(poll_interval_ms, Some(500));
                assert_eq!(extract_timeout_secs, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn enqueue_requires_at_least_one_file() {
        assert!(Cli::try_parse_from(["intake-worker", "enqueue"]).is_err());

        let cli = Cli::parse_from(["intake-worker", "enqueue", "a.png", "b.jpg"]);
        match cli.command {
            Command::Enqueue { files } => assert_eq!(files.len(), 2),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn mime_guesses_cover_common_scans() {
        assert_eq!(guess_mime_type("receipt.PNG"), "image/png");
        assert_eq!(guess_mime_type("scan.jpeg"), "image/jpeg");
        assert_eq!(guess_mime_type("contract.pdf"), "application/pdf");
        assert_eq!(guess_mime_type("no_extension"), "application/octet-stream");
    }
}

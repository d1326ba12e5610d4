//! Local model variant: a resource-constrained on-device model invoked as a
//! subprocess, with no network dependency.

use std::path::PathBuf;
use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExtractRequest, ExtractedRecord, ExtractionError, ExtractionErrorKind,
    ExtractionProvider};

/// Runs extraction through a local model-runner executable.
///
/// Protocol: the image bytes go to the runner's stdin, the structured record
/// comes back as JSON on stdout. Availability is runtime capability
/// detection: the runner binary must exist and be executable. The runner may
/// be slower or lower-confidence than the remote model; that trade-off is the
/// caller's to make.
pub struct LocalModelProvider {
    runner: PathBuf,
}

impl LocalModelProvider {
    pub fn new(runner: PathBuf) -> Self {
        Self { runner }
    }

    fn runner_is_executable(&self) -> bool {
        let Ok(metadata) = std::fs::metadata(&self.runner) else {
            return false;
        };
        if !metadata.is_file() {
            return false;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o111 != 0
        }
        #[cfg(not(unix))]
        {
            true
        }
    }
}

impl ExtractionProvider for LocalModelProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn is_available(&self) -> bool {
        self.runner_is_executable()
    }

    fn extract<'a>(
        &'a self,
        request: ExtractRequest<'a>,
    ) -> BoxFuture<'a, Result<ExtractedRecord, ExtractionError>> {
        Box::pin(async move {
            if !self.is_available() {
                return Err(ExtractionError::new(
                    ExtractionErrorKind::Unavailable,
                    format!(
                        "local model runner not found or not executable: {}",
                        self.runner.display()
                    ),
                ));
            }

            debug!(
                event = "local_extraction_started",
                runner = %self.runner.display(),
                file_name = request.file_name,
                payload_bytes = request.payload.len(),
                "invoking local model runner"
            );

            let mut child = Command::new(&self.runner)
                .arg("--mime-type")
                .arg(request.mime_type)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| {
                    ExtractionError::new(
                        ExtractionErrorKind::Unavailable,
                        format!("failed to launch local model runner: {err}"),
                    )
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(request.payload).await.map_err(|err| {
                    ExtractionError::new(
                        ExtractionErrorKind::Unavailable,
                        format!("failed to stream payload to local model runner: {err}"),
                    )
                })?;
                // Close stdin so the runner sees EOF and starts inference.
                drop(stdin);
            }

            let output = child.wait_with_output().await.map_err(|err| {
                ExtractionError::new(
                    ExtractionErrorKind::Unavailable,
                    format!("local model runner did not complete: {err}"),
                )
            })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ExtractionError::new(
                    ExtractionErrorKind::Unavailable,
                    format!(
                        "local model runner exited with {}: {}",
                        output.status,
                        stderr.trim()
                    ),
                ));
            }

            serde_json::from_slice::<ExtractedRecord>(&output.stdout).map_err(|err| {
                ExtractionError::new(
                    ExtractionErrorKind::MalformedResponse,
                    format!("local model runner produced invalid JSON: {err}"),
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_runner_is_unavailable() {
        let provider = LocalModelProvider::new(PathBuf::from("/nonexistent/model-runner"));
        assert!(!provider.is_available());
    }

    #[tokio::test]
    async fn extract_with_missing_runner_fails_with_unavailable() {
        let provider = LocalModelProvider::new(PathBuf::from("/nonexistent/model-runner"));
        let err = provider
            .extract(ExtractRequest {
                file_name: "scan.png",
                mime_type: "image/png",
                payload: b"not a real image",
            })
            .await
            .expect_err("extraction should fail without a runner");

        assert_eq!(err.kind, ExtractionErrorKind::Unavailable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extract_parses_runner_stdout_as_record() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let runner_path = dir.path().join("fake-runner.sh");
        {
            let mut file = std::fs::File::create(&runner_path).expect("failed to write runner");
            writeln!(
                file,
                "#!/bin/sh\ncat > /dev/null\necho '{{\"document_kind\":\"receipt\",\"fields\":{{\"total\":\"12.50\"}},\"confidence\":0.9}}'"
            )
            .expect("failed to write runner script");
        }
        std::fs::set_permissions(&runner_path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod runner");

        let provider = LocalModelProvider::new(runner_path);
        assert!(provider.is_available());

        let record = provider
            .extract(ExtractRequest {
                file_name: "scan.png",
                mime_type: "image/png",
                payload: b"bytes",
            })
            .await
            .expect("extraction should succeed");

        assert_eq!(record.document_kind.as_deref(), Some("receipt"));
        assert_eq!(record.fields.get("total").map(String::as_str), Some("12.50"));
    }
}

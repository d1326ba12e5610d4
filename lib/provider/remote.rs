//! Remote model variant: an API-backed extraction endpoint reached over HTTP.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::debug;

use super::error_mapping::{map_status, map_transport_error};
use super::{ExtractRequest, ExtractedRecord, ExtractionError, ExtractionErrorKind,
    ExtractionProvider, ProviderConfigError};

#[derive(Serialize)]
struct ExtractionBody<'a> {
    file_name: &'a str,
    mime_type: &'a str,
    content_base64: String,
}

/// Extraction backed by a remote model API.
///
/// Requires a non-empty credential; availability is assumed whenever one is
/// configured, and auth failures surface at call time as `Unauthorized`
/// rather than at availability-check time. The client-level timeout is a
/// second line of defense behind the processor's own per-call timeout.
#[derive(Debug)]
pub struct RemoteModelProvider {
    client: reqwest::Client,
    endpoint: String,
    credential: String,
}

impl RemoteModelProvider {
    pub fn new(
        endpoint: String,
        credential: String,
        timeout: Duration,
    ) -> Result<Self, ProviderConfigError> {
        if endpoint.trim().is_empty() {
            return Err(ProviderConfigError::MissingEndpoint);
        }
        if credential.trim().is_empty() {
            return Err(ProviderConfigError::MissingCredential);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderConfigError::Client(err.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            credential,
        })
    }
}

impl ExtractionProvider for RemoteModelProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_available(&self) -> bool {
        !self.credential.is_empty()
    }

    fn extract<'a>(
        &'a self,
        request: ExtractRequest<'a>,
    ) -> BoxFuture<'a, Result<ExtractedRecord, ExtractionError>> {
        Box::pin(async move {
            let body = ExtractionBody {
                file_name: request.file_name,
                mime_type: request.mime_type,
                content_base64: BASE64.encode(request.payload),
            };

            debug!(
                event = "remote_extraction_started",
                endpoint = %self.endpoint,
                file_name = request.file_name,
                payload_bytes = request.payload.len(),
                "posting submission to extraction endpoint"
            );

            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.credential)
                .json(&body)
                .send()
                .await
                .map_err(map_transport_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(map_status(status.as_u16()));
            }

            response.json::<ExtractedRecord>().await.map_err(|err| {
                if err.is_timeout() {
                    return map_transport_error(err);
                }
                ExtractionError::new(
                    ExtractionErrorKind::MalformedResponse,
                    format!("extraction endpoint returned an unparseable record: {err}"),
                )
            })
        })
    }
}

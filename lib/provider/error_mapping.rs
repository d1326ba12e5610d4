//! Maps transport-level failures into the closed extraction error set.

use super::{ExtractionError, ExtractionErrorKind};

/// Maps a reqwest transport error raised before a usable response arrived.
pub(crate) fn map_transport_error(err: reqwest::Error) -> ExtractionError {
    if err.is_timeout() {
        return ExtractionError::new(
            ExtractionErrorKind::Timeout,
            format!("extraction request timed out: {err}"),
        );
    }

    if let Some(status) = err.status() {
        return map_status(status.as_u16());
    }

    if err.is_connect() || err.is_request() || err.is_body() {
        return ExtractionError::new(
            ExtractionErrorKind::Network,
            format!("network/transport error during extraction: {err}"),
        );
    }

    if err.is_decode() {
        return ExtractionError::new(
            ExtractionErrorKind::MalformedResponse,
            format!("undecodable extraction response: {err}"),
        );
    }

    ExtractionError::new(
        ExtractionErrorKind::Network,
        format!("unexpected transport failure during extraction: {err}"),
    )
}

/// Maps a non-success HTTP status from the extraction endpoint.
pub(crate) fn map_status(status: u16) -> ExtractionError {
    match status {
        401 | 403 => ExtractionError::new(
            ExtractionErrorKind::Unauthorized,
            format!("extraction endpoint rejected the credential (HTTP {status})"),
        ),
        408 => ExtractionError::new(
            ExtractionErrorKind::Timeout,
            "extraction endpoint reported a request timeout (HTTP 408)",
        ),
        429 => ExtractionError::new(
            ExtractionErrorKind::RateLimited,
            "rate limited by extraction endpoint (HTTP 429)",
        ),
        500..=599 => ExtractionError::new(
            ExtractionErrorKind::Unavailable,
            format!("extraction endpoint unavailable (HTTP {status})"),
        ),
        _ => ExtractionError::new(
            ExtractionErrorKind::MalformedResponse,
            format!("unexpected HTTP status {status} from extraction endpoint"),
        ),
    }
}

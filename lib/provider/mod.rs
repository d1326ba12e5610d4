mod error_mapping;
mod local;
mod remote;

pub use local::LocalModelProvider;
pub use remote::RemoteModelProvider;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured output of one extraction call.
///
/// The worker never interprets `fields`; they flow through to whatever
/// consumes completed queue items (a form, a report, the backup target).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Borrowed view of one submission handed to a provider.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRequest<'a> {
    pub file_name: &'a str,
    pub mime_type: &'a str,
    pub payload: &'a [u8],
}

/// Closed set of extraction failure classes.
///
/// Providers map their own failures into this set so the background processor
/// can apply uniform policy; the distinction matters for user-facing
/// messaging, not for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionErrorKind {
    Unavailable,
    Unauthorized,
    RateLimited,
    Timeout,
    MalformedResponse,
    Network,
}

impl ExtractionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::MalformedResponse => "malformed_response",
            Self::Network => "network",
        }
    }
}

/// Typed extraction failure with human-readable details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Performs the actual extraction, local or remote.
///
/// This trait exists so the processor can be unit-tested against
/// deterministic scripted outcomes without a model runtime or live network.
/// Providers never retry internally; retry policy belongs to callers.
pub trait ExtractionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the provider can plausibly serve the next `extract` call.
    ///
    /// For the remote variant this only reflects configuration, not network
    /// reachability; auth and transport failures surface at call time.
    fn is_available(&self) -> bool;

    fn extract<'a>(
        &'a self,
        request: ExtractRequest<'a>,
    ) -> BoxFuture<'a, Result<ExtractedRecord, ExtractionError>>;
}

/// Errors raised while validating or applying a provider selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderConfigError {
    #[error("remote provider requires a non-empty credential")]
    MissingCredential,
    #[error("remote provider requires an endpoint URL")]
    MissingEndpoint,
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Swappable handle to the active extraction provider.
///
/// The processor resolves the active provider once per item, so a switch
/// takes effect for the next `extract` call; an in-flight extraction keeps
/// the provider it started with.
pub struct ProviderHandle {
    active: RwLock<Arc<dyn ExtractionProvider>>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn ExtractionProvider>) -> Self {
        Self {
            active: RwLock::new(provider),
        }
    }

    pub fn active(&self) -> Arc<dyn ExtractionProvider> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn swap(&self, provider: Arc<dyn ExtractionProvider>) {
        let mut guard = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = provider;
    }
}

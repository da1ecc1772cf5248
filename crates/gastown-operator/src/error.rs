/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Error Taxonomy
//!
//! Every failure a reconciler can hit is classified into an [`ErrorKind`]. The
//! kind decides two things:
//!
//! - whether the controller requeues the object with a backoff delay
//! - which condition reason is written to the object's status
//!
//! | Kind          | Reason             | Retryable |
//! |---------------|--------------------|-----------|
//! | Transient     | `TransientError`   | yes       |
//! | Permanent     | `PermanentError`   | no        |
//! | Validation    | `ValidationError`  | no        |
//! | NotFound      | `ResourceNotFound` | no        |
//! | Conflict      | `ConflictError`    | yes       |
//! | Internal      | `InternalError`    | no        |
//! | ExternalTool  | `GTCLIError`       | yes       |
//! | unclassified  | `UnknownError`     | no        |
//!
//! Errors capture the `file:line` where they were raised; [`OperatorError::at`]
//! appends further frames as the error travels up the call chain.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;

pub type Result<T, E = OperatorError> = std::result::Result<T, E>;

/// Reason written for errors that carry no classification
pub const UNKNOWN_REASON: &str = "UnknownError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Validation,
    NotFound,
    Conflict,
    Internal,
    ExternalTool,
}

impl ErrorKind {
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TransientError",
            ErrorKind::Permanent => "PermanentError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::NotFound => "ResourceNotFound",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::ExternalTool => "GTCLIError",
        }
    }

    /// Default retry decision for a kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Conflict | ErrorKind::ExternalTool
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
            ErrorKind::ExternalTool => "external tool",
        };
        f.write_str(name)
    }
}

/// Maps a (possibly absent) classification to a condition reason.
pub fn reason_for(kind: Option<ErrorKind>) -> &'static str {
    kind.map(|k| k.reason()).unwrap_or(UNKNOWN_REASON)
}

/// Classifies an arbitrary error. Only operator and Kubernetes client errors
/// carry a classification.
pub fn classify(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    if let Some(op) = err.downcast_ref::<OperatorError>() {
        return Some(op.kind);
    }
    err.downcast_ref::<kube::Error>().map(classify_kube)
}

/// Classification of Kubernetes client errors by API status code
pub fn classify_kube(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 | 500 | 502 | 503 | 504 => ErrorKind::Transient,
            400 | 403 | 422 => ErrorKind::Permanent,
            _ => ErrorKind::Internal,
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Internal,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct OperatorError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub context: BTreeMap<String, String>,
    /// Innermost frame first
    pub call_path: Vec<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl OperatorError {
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            context: BTreeMap::new(),
            call_path: vec![frame(Location::caller())],
            source: None,
        }
    }

    #[track_caller]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    #[track_caller]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    #[track_caller]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[track_caller]
    pub fn external_tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalTool, message)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Records the current call site as the error propagates outward.
    #[track_caller]
    pub fn at(mut self) -> Self {
        self.call_path.push(frame(Location::caller()));
        self
    }

    pub fn reason(&self) -> &'static str {
        self.kind.reason()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

fn frame(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

impl From<kube::Error> for OperatorError {
    #[track_caller]
    fn from(err: kube::Error) -> Self {
        let kind = classify_kube(&err);
        let mut op = OperatorError::new(kind, err.to_string());
        if let kube::Error::Api(resp) = &err {
            op = op
                .with_context("status_code", resp.code)
                .with_context("api_reason", &resp.reason);
        }
        op.with_source(err)
    }
}

impl From<serde_json::Error> for OperatorError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        OperatorError::new(ErrorKind::Internal, format!("serialization failed: {}", err))
            .with_source(err)
    }
}

impl From<humantime::DurationError> for OperatorError {
    #[track_caller]
    fn from(err: humantime::DurationError) -> Self {
        OperatorError::new(ErrorKind::Validation, format!("invalid duration: {}", err))
            .with_source(err)
    }
}

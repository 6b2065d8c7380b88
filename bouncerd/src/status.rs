use reconciler::{EngineError, Outcome};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Applied,
    Unchanged,
    Deferred,
    /// A conflict that only the operator can resolve.
    Blocked,
    Failed,
}

/// One line of `run` output, printed per event.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct StatusLine {
    pub event: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Set on failures: whether redelivering the event may succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl StatusLine {
    pub fn new(event: &str, result: &Result<Outcome, EngineError>) -> Self {
        let (status, detail, retryable) = match result {
            Ok(Outcome::Applied) => (Status::Applied, None, None),
            Ok(Outcome::Unchanged) => (Status::Unchanged, None, None),
            Ok(Outcome::Deferred(reason)) => (Status::Deferred, Some(reason.to_string()), None),
            Err(err) if err.conflict().is_some() => (Status::Blocked, Some(err.to_string()), None),
            Err(err) => (
                Status::Failed,
                Some(err.to_string()),
                Some(err.is_retryable()),
            ),
        };

        StatusLine {
            event: event.to_string(),
            status,
            detail,
            retryable,
        }
    }

    /// For input lines that are not a valid event.
    pub fn invalid(err: &serde_json::Error) -> Self {
        StatusLine {
            event: "invalid".to_string(),
            status: Status::Failed,
            detail: Some(err.to_string()),
            retryable: Some(false),
        }
    }
}

//! Execution outcome of a single request

use chrono::{DateTime, Utc};

use crate::constants::connections;

/// Outcome of executing a request
///
/// Transport failures are folded into this type rather than returned as
/// errors: `response_code` is `-1` and `result` is `None` when no response was
/// received. A cancelled request may still carry a result if the response
/// arrived before cancellation took effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultInfo<T> {
    /// Translated response, if translation succeeded
    pub result: Option<T>,
    /// When the request was issued
    pub request_timestamp: DateTime<Utc>,
    /// HTTP status code, or `-1` if there was no response
    pub response_code: i32,
    /// Reason phrase of the response
    pub response_message: Option<String>,
    /// Whether the request was cancelled at any point
    pub cancelled: bool,
}

impl<T> ResultInfo<T> {
    /// Outcome of a request that received a response
    pub fn new(
        result: Option<T>,
        request_timestamp: DateTime<Utc>,
        response_code: i32,
        response_message: Option<String>,
    ) -> Self {
        Self {
            result,
            request_timestamp,
            response_code,
            response_message,
            cancelled: false,
        }
    }

    /// Outcome of a request that received no response
    pub fn failed(request_timestamp: DateTime<Utc>) -> Self {
        Self {
            result: None,
            request_timestamp,
            response_code: connections::NO_RESPONSE_CODE,
            response_message: None,
            cancelled: false,
        }
    }

    /// Mark the outcome as cancelled
    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// Whether the response code is in the 2xx range
    pub fn is_status_ok(&self) -> bool {
        (200..300).contains(&self.response_code)
    }

    /// Whether a response was received at all
    pub fn has_response(&self) -> bool {
        self.response_code != connections::NO_RESPONSE_CODE
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Consume the outcome, keeping only the translated result
    pub fn into_result(self) -> Option<T> {
        self.result
    }
}

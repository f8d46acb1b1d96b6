//! Freshness policies deciding whether a cached file can be served

use std::time::Duration;

use crate::app::request::RequestBuilder;

/// Decides whether a completed download of `request` that is `age` old may be
/// served without refetching
pub trait FreshnessPolicy: Send + Sync {
    fn is_fresh(&self, request: &RequestBuilder, age: Duration) -> bool;
}

/// Fresh for a fixed time after download, or forever when no limit is set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaxAgePolicy {
    max_age: Option<Duration>,
}

impl MaxAgePolicy {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
        }
    }

    /// A policy under which nothing ever goes stale
    pub fn never_stale() -> Self {
        Self { max_age: None }
    }

    pub fn from_option(max_age: Option<Duration>) -> Self {
        Self { max_age }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }
}

impl FreshnessPolicy for MaxAgePolicy {
    fn is_fresh(&self, _request: &RequestBuilder, age: Duration) -> bool {
        match self.max_age {
            Some(max_age) => age < max_age,
            None => true,
        }
    }
}

impl<F> FreshnessPolicy for F
where
    F: Fn(&RequestBuilder, Duration) -> bool + Send + Sync,
{
    fn is_fresh(&self, request: &RequestBuilder, age: Duration) -> bool {
        self(request, age)
    }
}

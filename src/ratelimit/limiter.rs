//! Per-request admission decisions on top of a [`WindowStore`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

use super::store::{WindowCount, WindowStore};
use crate::error::{Result, WardenError};

/// Key used when a request carries no caller identity.
pub const UNKNOWN_CALLER: &str = "unknown";

/// Message sent with a rejection when the policy does not set one.
pub const DEFAULT_REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// Error code carried in every rejection body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Status code of a rejection.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Immutable limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterPolicy {
    window: Duration,
    max_requests: u64,
    rejection_message: Option<String>,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
}

impl LimiterPolicy {
    /// Create a policy allowing `max_requests` per `window`.
    ///
    /// Fails when either is zero.
    pub fn new(window: Duration, max_requests: u64) -> Result<Self> {
        if window.is_zero() {
            return Err(WardenError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(WardenError::Config(
                "max requests must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            window,
            max_requests,
            rejection_message: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
        })
    }

    /// A policy from values known to be non-zero.
    pub(crate) fn preset(window: Duration, max_requests: u64, message: &str) -> Self {
        Self {
            window,
            max_requests,
            rejection_message: Some(message.to_string()),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    /// Create a policy with the window given in milliseconds.
    pub fn from_millis(window_ms: u64, max_requests: u64) -> Result<Self> {
        Self::new(Duration::from_millis(window_ms), max_requests)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.rejection_message = Some(message.into());
        self
    }

    /// Give back the count of requests that complete successfully.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Give back the count of requests that complete with a failure.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn rejection_message(&self) -> &str {
        self.rejection_message
            .as_deref()
            .unwrap_or(DEFAULT_REJECTION_MESSAGE)
    }

    fn skips(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success => self.skip_successful_requests,
            Outcome::Failure => self.skip_failed_requests,
        }
    }

    fn observes_outcome(&self) -> bool {
        self.skip_successful_requests || self.skip_failed_requests
    }
}

/// Failure to attach metadata to a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// The response can no longer be modified
    #[error("response already finalized")]
    Closed,

    /// The header name or value was refused
    #[error("invalid header: {0}")]
    Invalid(String),
}

/// What a limiter needs from the transport for one request.
pub trait RequestContext {
    /// The caller's network address, if known.
    fn caller_address(&self) -> Option<String>;

    /// Attach a header to the eventual response.
    fn set_header(
        &mut self,
        name: &'static str,
        value: &str,
    ) -> std::result::Result<(), HeaderError>;
}

/// Derives the counting key for a request.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, ctx: &dyn RequestContext) -> Option<String>;
}

/// Keys requests by caller network address.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerAddress;

impl KeyExtractor for CallerAddress {
    fn extract(&self, ctx: &dyn RequestContext) -> Option<String> {
        ctx.caller_address()
    }
}

impl<F> KeyExtractor for F
where
    F: Fn(&dyn RequestContext) -> Option<String> + Send + Sync,
{
    fn extract(&self, ctx: &dyn RequestContext) -> Option<String> {
        self(ctx)
    }
}

/// Quota state reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    /// Never negative, even while blocked
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl Quota {
    fn from_count(limit: u64, counted: WindowCount) -> Self {
        Self {
            limit,
            remaining: limit.saturating_sub(counted.count),
            reset_at: counted.reset_at,
        }
    }

    /// The three `X-RateLimit-*` headers.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, format_timestamp(self.reset_at)),
        ]
    }

    fn apply(&self, ctx: &mut dyn RequestContext) {
        for (name, value) in self.headers() {
            if let Err(err) = ctx.set_header(name, &value) {
                trace!(header = name, error = %err, "Could not set quota header");
            }
        }
    }
}

/// Outcome of the downstream handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Statuses below 400 count as success.
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Handle for reporting how an admitted request ended.
///
/// Only issued when the policy skips some outcomes. Dropping it without
/// recording leaves the request counted.
#[derive(Debug)]
pub struct Completion {
    store: Weak<WindowStore>,
    key: String,
    reset_at: DateTime<Utc>,
    policy: LimiterPolicy,
}

impl Completion {
    /// Record the downstream response status.
    pub fn record(self, status: u16) {
        self.record_outcome(Outcome::from_status(status));
    }

    /// Record the downstream outcome, uncounting the request if the policy
    /// skips it.
    pub fn record_outcome(self, outcome: Outcome) {
        if !self.policy.skips(outcome) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            trace!(key = %self.key, "Store gone, outcome ignored");
            return;
        };
        if store.decrement(&self.key, self.reset_at) {
            trace!(key = %self.key, ?outcome, "Request uncounted");
        }
    }
}

/// An admitted request.
#[derive(Debug)]
pub struct Admission {
    /// Absent when enforcement is disabled
    pub quota: Option<Quota>,
    /// Present when the policy wants to hear the outcome
    pub completion: Option<Completion>,
}

impl Admission {
    fn unmetered() -> Self {
        Self {
            quota: None,
            completion: None,
        }
    }

    /// Report the downstream status, if anyone is listening.
    pub fn finish(self, status: u16) {
        if let Some(completion) = self.completion {
            completion.record(status);
        }
    }
}

/// JSON body of a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionBody {
    pub error: RejectionDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionDetail {
    pub code: &'static str,
    pub message: String,
    pub timestamp: String,
    /// Whole seconds until the window resets
    pub retry_after: u64,
}

/// A refused request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub quota: Quota,
    pub body: RejectionBody,
}

impl Rejection {
    fn new(policy: &LimiterPolicy, quota: Quota, now: DateTime<Utc>) -> Self {
        Self {
            quota,
            body: RejectionBody {
                error: RejectionDetail {
                    code: RATE_LIMIT_EXCEEDED,
                    message: policy.rejection_message().to_string(),
                    timestamp: format_timestamp(now),
                    retry_after: seconds_until(now, quota.reset_at),
                },
            },
        }
    }

    pub fn status(&self) -> u16 {
        STATUS_TOO_MANY_REQUESTS
    }

    pub fn retry_after(&self) -> u64 {
        self.body.error.retry_after
    }
}

/// Result of evaluating one request.
#[derive(Debug)]
pub enum Decision {
    /// Continue downstream exactly once
    Allowed(Admission),
    /// Answer with the rejection; do not continue
    Rejected(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Decision::Allowed(admission) => admission.quota.as_ref(),
            Decision::Rejected(rejection) => Some(&rejection.quota),
        }
    }
}

/// A fixed-window admission limiter.
pub struct Limiter {
    name: String,
    policy: LimiterPolicy,
    store: Arc<WindowStore>,
    extractor: Arc<dyn KeyExtractor>,
    namespace: Option<String>,
    enabled: bool,
}

impl Limiter {
    /// Create an enabled limiter counting into `store`, keyed by caller
    /// address.
    pub fn new(name: impl Into<String>, policy: LimiterPolicy, store: Arc<WindowStore>) -> Self {
        Self {
            name: name.into(),
            policy,
            store,
            extractor: Arc::new(CallerAddress),
            namespace: None,
            enabled: true,
        }
    }

    pub fn with_key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    /// Prefix every key, so several limiters can share one store.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// A disabled limiter admits everything without counting.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count the request and decide whether it may continue.
    ///
    /// Quota headers are set on `ctx` before the decision is made.
    pub fn evaluate(&self, ctx: &mut dyn RequestContext) -> Decision {
        if !self.enabled {
            return Decision::Allowed(Admission::unmetered());
        }

        let caller = match self.extractor.extract(&*ctx) {
            Some(caller) => caller,
            None => {
                trace!(limiter = %self.name, "No caller key, using shared bucket");
                UNKNOWN_CALLER.to_string()
            }
        };
        let key = self.store_key(&caller);

        let counted = self.store.increment(&key, self.policy.window);
        let quota = Quota::from_count(self.policy.max_requests, counted);

        trace!(
            limiter = %self.name,
            key = %key,
            count = counted.count,
            remaining = quota.remaining,
            "Evaluated request"
        );

        quota.apply(ctx);

        if counted.count > self.policy.max_requests {
            let rejection = Rejection::new(&self.policy, quota, self.store.now());
            debug!(
                limiter = %self.name,
                key = %key,
                count = counted.count,
                limit = self.policy.max_requests,
                retry_after = rejection.retry_after(),
                "Rate limit exceeded"
            );
            return Decision::Rejected(rejection);
        }

        let completion = self.policy.observes_outcome().then(|| Completion {
            store: Arc::downgrade(&self.store),
            key,
            reset_at: counted.reset_at,
            policy: self.policy.clone(),
        });

        Decision::Allowed(Admission {
            quota: Some(quota),
            completion,
        })
    }

    /// Forget a caller's current window.
    pub fn reset_key(&self, caller: &str) {
        self.store.reset_key(&self.store_key(caller));
    }

    fn store_key(&self, caller: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, caller),
            None => caller.to_string(),
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn seconds_until(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    let millis = (then - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

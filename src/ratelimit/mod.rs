//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod profiles;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    Admission, CallerAddress, Completion, Decision, HeaderError, KeyExtractor, Limiter,
    LimiterPolicy, Outcome, Quota, Rejection, RejectionBody, RejectionDetail, RequestContext,
    DEFAULT_REJECTION_MESSAGE, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, RATE_LIMIT_EXCEEDED,
    STATUS_TOO_MANY_REQUESTS, UNKNOWN_CALLER,
};
pub use profiles::{Profile, Profiles};
pub use store::{WindowCount, WindowEntry, WindowStore};

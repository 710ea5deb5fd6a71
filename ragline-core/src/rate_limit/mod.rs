//! Per-session admission control built on token buckets.

mod bucket;
mod limiter;
mod store;

pub use bucket::{Admission, BucketSnapshot, MAX_RETRY_AFTER, TokenBucket};
pub use limiter::{
    AdmissionDenied, Decision, LimiterPolicy, Limits, Quota, RateLimitHeaders, RateLimiter,
    resolve,
};
pub use store::{BucketKey, BucketStore, SweeperHandle};

//! Built-in middlewares.
//!
//! Each is an ordinary [`Middleware`](super::Middleware) that owns its
//! state; none is installed by default.

pub mod content_filter;
pub mod fallback;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod timeout;

pub use content_filter::{ContentFilterMiddleware, FilterAction};
pub use fallback::{FallbackMiddleware, FallbackTarget};
pub use logging::LoggingMiddleware;
pub use metrics::{MetricsMiddleware, MetricsSnapshot};
pub use rate_limit::RateLimitMiddleware;
pub use retry::{RetryMiddleware, RetryPolicy};
pub use timeout::TimeoutMiddleware;

/// Default priorities of the built-ins. Lower runs earlier in the request
/// and error phases.
pub mod priority {
    pub const LOGGING: i32 = 0;
    pub const METRICS: i32 = 5;
    pub const CONTENT_FILTER: i32 = 10;
    pub const RATE_LIMIT: i32 = 20;
    pub const TIMEOUT: i32 = 30;
    pub const RETRY: i32 = 50;
    pub const FALLBACK: i32 = 60;
}

//! Sliding-window rate limiting logic and state management.

mod clock;
mod decision;
mod key;
mod limiter;
mod reaper;
mod rules;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, Policy, WindowStats, DEFAULT_STATS_WINDOW_SECS};
pub use key::{LimitKey, SCOPE_SEPARATOR};
pub use limiter::{global, RateLimiter};
pub use reaper::spawn_reaper;
pub use rules::{PolicyRule, PolicyTable, TimeUnit, WindowSpec};
pub use window::WindowState;

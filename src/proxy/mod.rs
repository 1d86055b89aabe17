//! Request coalescing and admission control in front of the parents.

pub mod singleflight;
pub mod throttle;

pub use singleflight::{CanUseFn, FetchFn, Getter};
pub use throttle::{RuleThrottlers, Throttler};

//! Distributed rate limiting drivers and their window arithmetic.

mod driver;
mod leaky;
mod sliding;
pub mod window;

pub use driver::{Admission, AdmissionDriver, LimiterSnapshot};
pub use leaky::{LeakyBucketDriver, LeakyBucketOptions};
pub use sliding::{SlidingWindowCounterDriver, SlidingWindowOptions};

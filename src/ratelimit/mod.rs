//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod registry;

pub use bucket::{RateSpec, Reservation, TokenBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use key::{HeaderKey, KeyExtractor, KeySource, PeerAddr, PeerIp, RealIp, UNKNOWN_KEY};
pub use registry::KeyedLimiterRegistry;

//! Request normalization and canonical keys

pub mod descriptor;
pub mod key;

pub use descriptor::{DateRange, ExchangeSet, RawRequest, RequestDescriptor, DEFAULT_EXCHANGES};
pub use key::{CanonicalKey, RangeBucket};

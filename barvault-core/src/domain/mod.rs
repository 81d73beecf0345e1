//! Domain types for barvault

pub mod bar;
pub mod gap;
pub mod interval;

pub use bar::{round2, Bar};
pub use gap::{Gap, GapKind};
pub use interval::{EmptyInterval, Interval};

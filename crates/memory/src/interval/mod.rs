//! Page-size layouts
//!
//! An [`IntervalList`] declares which offsets of a region are backed by which
//! huge page size; [`validate`] rejects layouts a region could not honour.

mod list;
mod validator;

pub use list::{Interval, IntervalList};
pub use validator::{LayoutViolation, validate};

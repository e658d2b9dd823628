//! Library Module
//!
//! Face library lifecycle and name uniqueness.

mod registry;

pub(crate) use registry::validate_name;
pub use registry::LibraryRegistry;

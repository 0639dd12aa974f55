//! Shared helpers.

pub mod fs;
pub mod throttle;
pub mod time;
pub mod view;

pub use view::DerivedView;

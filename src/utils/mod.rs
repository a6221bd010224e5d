//! Various utilities functions and types

mod geometry;
pub(crate) mod ids;
pub mod serial;

pub use self::geometry::{Point, Rectangle, Size, Transform};
pub use self::serial::{Serial, SerialCounter};

/// This resource has been destroyed and can no longer be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadResource;

impl std::fmt::Display for DeadResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("This resource has been destroyed and can no longer be used.")
    }
}

impl std::error::Error for DeadResource {}

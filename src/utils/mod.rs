//! Various utilities functions and types

mod geometry;

pub use self::geometry::{Point, Rectangle, Size};

use std::fmt;

/// A point as defined by its x and y coordinates
///
/// Used for cursor positions and hotspots in the coordinate space of the
/// guest's primary plane.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point<N> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
}

impl<N> Point<N> {
    /// Create a new point
    #[inline]
    pub const fn new(x: N, y: N) -> Self {
        Point { x, y }
    }
}

impl<N: fmt::Debug> fmt::Debug for Point<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<N> From<(N, N)> for Point<N> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N> {
        Point { x, y }
    }
}

impl<N> From<Point<N>> for (N, N) {
    #[inline]
    fn from(point: Point<N>) -> (N, N) {
        (point.x, point.y)
    }
}

/// A size as defined by its width and height
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size<N> {
    /// horizontal coordinate
    pub w: N,
    /// vertical coordinate
    pub h: N,
}

impl<N> Size<N> {
    /// Create a new size
    #[inline]
    pub const fn new(w: N, h: N) -> Self {
        Size { w, h }
    }
}

impl Size<u32> {
    /// Check if this size has no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }
}

impl<N: fmt::Debug> fmt::Debug for Size<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<N> From<(N, N)> for Size<N> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N> {
        Size { w, h }
    }
}

impl<N> From<Size<N>> for (N, N) {
    #[inline]
    fn from(size: Size<N>) -> (N, N) {
        (size.w, size.h)
    }
}

/// A rectangle defined by its top-left corner and dimensions
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rectangle<N> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<N>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<N>,
}

impl<N: Default> Rectangle<N> {
    /// Create a new [`Rectangle`] located at the origin, covering a surface of `size`
    #[inline]
    pub fn from_size(size: impl Into<Size<N>>) -> Self {
        Rectangle {
            loc: Point::default(),
            size: size.into(),
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for Rectangle<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

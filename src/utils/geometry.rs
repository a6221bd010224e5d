#[cfg(feature = "wayland_frontend")]
use wayland_server::protocol::wl_output::Transform as WlTransform;

/// A point in surface-local coordinates
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Point {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
}

impl From<(i32, i32)> for Point {
    #[inline]
    fn from((x, y): (i32, i32)) -> Point {
        Point { x, y }
    }
}

/// A two-dimensional size
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Size {
    /// width
    pub w: i32,
    /// height
    pub h: i32,
}

impl From<(i32, i32)> for Size {
    #[inline]
    fn from((w, h): (i32, i32)) -> Size {
        Size { w, h }
    }
}

impl Size {
    /// Whether both dimensions are strictly positive
    #[inline]
    pub fn is_positive(&self) -> bool {
        self.w > 0 && self.h > 0
    }
}

/// A rectangle defined by its top-left corner and dimensions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rectangle {
    /// Location of the top-left corner of the rectangle
    pub loc: Point,
    /// Size of the rectangle
    pub size: Size,
}

impl Rectangle {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point>, size: impl Into<Size>) -> Rectangle {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Checks whether given point is inside the rectangle
    pub fn contains(&self, point: impl Into<Point>) -> bool {
        let p = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x.saturating_add(self.size.w))
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y.saturating_add(self.size.h))
    }
}

/// Possible transformations to two-dimensional planes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    /// Identity transformation (plane is unaltered when applied)
    #[default]
    Normal,
    /// Plane is rotated by 90 degrees
    _90,
    /// Plane is rotated by 180 degrees
    _180,
    /// Plane is rotated by 270 degrees
    _270,
    /// Plane is flipped vertically
    Flipped,
    /// Plane is flipped vertically and rotated by 90 degrees
    Flipped90,
    /// Plane is flipped vertically and rotated by 180 degrees
    Flipped180,
    /// Plane is flipped vertically and rotated by 270 degrees
    Flipped270,
}

#[cfg(feature = "wayland_frontend")]
impl From<WlTransform> for Transform {
    #[inline]
    fn from(transform: WlTransform) -> Transform {
        match transform {
            WlTransform::_90 => Transform::_90,
            WlTransform::_180 => Transform::_180,
            WlTransform::_270 => Transform::_270,
            WlTransform::Flipped => Transform::Flipped,
            WlTransform::Flipped90 => Transform::Flipped90,
            WlTransform::Flipped180 => Transform::Flipped180,
            WlTransform::Flipped270 => Transform::Flipped270,
            _ => Transform::Normal,
        }
    }
}

//! Host side of the display: the console planes are presented on.
//!
//! A [`Console`] is whatever the host uses to show the guest's display, be it
//! a window, a remote desktop server or a headless recorder. The display
//! controllers in [`display`](crate::display) only tell it *what* to show:
//! which dmabuf to scan out, which cursor image to use and where it is, or
//! which [`DisplaySurface`] to read pixels from. How the pixels reach the
//! screen is up to the console.
//!
//! All calls are fire-and-forget, a console reports failures on its own.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

use crate::display::dmabuf::DmabufBuffer;
use crate::format::{get_bpp, Fourcc};
use crate::utils::{Point, Rectangle, Size};


/// Host console receiving the planes of a device
pub trait Console {
    /// Returns true if the console can scan out dmabufs
    fn supports_dmabuf(&self) -> bool {
        true
    }

    /// The guest display changed its dimensions
    fn resize(&mut self, size: Size<u32>);

    /// Scan out `dmabuf` as the primary plane
    fn scanout_dmabuf(&mut self, dmabuf: &DmabufBuffer);

    /// Stop scanning out the current primary dmabuf
    fn scanout_disable(&mut self);

    /// Use `dmabuf` as cursor image
    ///
    /// `hotspot` is `None` if the device does not define one.
    fn cursor_dmabuf(&mut self, dmabuf: &DmabufBuffer, hotspot: Option<Point<u32>>);

    /// Remove the current cursor image
    fn clear_cursor(&mut self);

    /// Move the cursor
    fn cursor_position(&mut self, position: Point<u32>);

    /// Drop every reference the console holds to `dmabuf`
    ///
    /// Called right before the buffer's file descriptor is closed.
    fn release_dmabuf(&mut self, dmabuf: &DmabufBuffer);

    /// Show the contents of `surface` from now on
    ///
    /// The console must not access the surface memory after the next call to
    /// `replace_surface`, [`scanout_disable`](Console::scanout_disable) or
    /// [`close`](Console::close).
    fn replace_surface(&mut self, surface: &DisplaySurface);

    /// The given area of the current plane has new contents
    fn update(&mut self, damage: Rectangle<u32>);

    /// Redraw everything on the next occasion
    fn update_full(&mut self);

    /// Tear down the console, no further calls will follow except releases
    fn close(&mut self);
}

/// Simple framebuffer shown while the device exports no plane
///
/// Typically a ramfb the guest firmware draws its boot screen into.
pub trait Fallback<C: ?Sized>: fmt::Debug {
    /// Present the current framebuffer contents on `console`
    fn update(&mut self, console: &mut C);
}

/// Errors thrown while creating a [`DisplaySurface`]
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// The stride is too small for a line of pixels
    #[error("Stride {stride} is too small for {width} pixels of {format}")]
    InvalidStride {
        /// Requested stride
        stride: u32,
        /// Requested width
        width: u32,
        /// Requested format
        format: Fourcc,
    },
    /// The surface would extend past the end of the memory backing it
    #[error("Surface of {required} bytes exceeds mapping of {available} bytes")]
    OutOfBounds {
        /// Bytes required by the surface
        required: u64,
        /// Bytes available in the mapping
        available: usize,
    },
}

/// Pixels of a display plane, read in place from device memory
///
/// The contents change whenever the guest draws, there is no synchronization
/// with the device.
pub struct DisplaySurface {
    ptr: NonNull<u8>,
    len: usize,
    size: Size<u32>,
    stride: u32,
    format: Fourcc,
}

impl fmt::Debug for DisplaySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplaySurface")
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

impl DisplaySurface {
    /// Create a surface on top of `available` bytes of memory at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads of `available` bytes for the whole
    /// lifetime of the returned surface.
    pub(crate) unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        available: usize,
        size: Size<u32>,
        stride: u32,
        format: Fourcc,
    ) -> Result<DisplaySurface, SurfaceError> {
        let bpp = get_bpp(format).unwrap_or(32) as u64;
        if (stride as u64) * 8 < size.w as u64 * bpp {
            return Err(SurfaceError::InvalidStride {
                stride,
                width: size.w,
                format,
            });
        }

        let required = stride as u64 * size.h as u64;
        if required > available as u64 {
            return Err(SurfaceError::OutOfBounds { required, available });
        }

        Ok(DisplaySurface {
            ptr,
            len: required as usize,
            size,
            stride,
            format,
        })
    }

    /// Dimensions of the surface in pixels
    pub fn size(&self) -> Size<u32> {
        self.size
    }

    /// Bytes per line
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format
    pub fn format(&self) -> Fourcc {
        self.format
    }

    /// Area covering the whole surface
    pub fn geometry(&self) -> Rectangle<u32> {
        Rectangle::from_size(self.size)
    }

    /// Raw pixel data, `stride * height` bytes
    pub fn data(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `from_raw_parts`
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::{DisplaySurface, SurfaceError};
    use crate::format::Fourcc;
    use crate::utils::Size;

    #[test]
    fn surface_fits_memory() {
        let mut memory = vec![0u8; 64 * 4 * 16];
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap();

        let len = memory.len();
        let surface =
            unsafe { DisplaySurface::from_raw_parts(ptr, len, Size::new(64, 16), 256, Fourcc::Xrgb8888) };
        let surface = surface.unwrap();
        assert_eq!(surface.data().len(), memory.len());
        assert_eq!(surface.geometry().size, Size::new(64, 16));

        let too_high =
            unsafe { DisplaySurface::from_raw_parts(ptr, len, Size::new(64, 17), 256, Fourcc::Xrgb8888) };
        assert!(matches!(too_high, Err(SurfaceError::OutOfBounds { .. })));
    }

    #[test]
    fn surface_stride_too_small() {
        let mut memory = vec![0u8; 4096];
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap();

        let len = memory.len();
        let surface =
            unsafe { DisplaySurface::from_raw_parts(ptr, len, Size::new(64, 4), 128, Fourcc::Argb8888) };
        assert!(matches!(surface, Err(SurfaceError::InvalidStride { .. })));
    }
}

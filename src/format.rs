//! Pixel format resolution for device-reported planes.
//!
//! The mediated device reports its scanout format as a raw DRM fourcc code.
//! Shareable buffers are handed to the console with that code untouched, but
//! a [`DisplaySurface`](crate::console::DisplaySurface) built on top of a
//! mapped region needs a format the host can read directly. [`resolve`]
//! performs that translation.
//!
//! ```
//! # use vfio_display::format::{resolve, get_bpp, Fourcc};
//! assert_eq!(resolve(Fourcc::Xrgb8888 as u32).unwrap(), Fourcc::Xrgb8888);
//! assert_eq!(get_bpp(Fourcc::Rgb565), Some(16));
//! assert!(resolve(0x2020_2020).is_err());
//! ```

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier, UnrecognizedFourcc};

/// Macro to generate the table of surface formats.
macro_rules! surface_formats {
    (
        $($fourcc: ident { bpp: $bpp: expr $(,)? }),* $(,)?
    ) => {
        /// Returns true if the format is usable for a [`DisplaySurface`](crate::console::DisplaySurface).
        pub const fn is_supported(fourcc: Fourcc) -> bool {
            matches!(fourcc, $(Fourcc::$fourcc)|*)
        }

        /// Returns the bits per pixel of the specified format.
        ///
        /// Unsupported formats will always return [`None`].
        pub const fn get_bpp(fourcc: Fourcc) -> Option<usize> {
            match fourcc {
                $(Fourcc::$fourcc => Some($bpp),)*
                _ => None,
            }
        }

        #[cfg(test)]
        fn _supported_formats() -> &'static [Fourcc] {
            &[$(Fourcc::$fourcc,)*]
        }
    };
}

surface_formats! {
    Rgb565 { bpp: 16 },
    Xrgb1555 { bpp: 16 },
    Rgb888 { bpp: 24 },
    Bgr888 { bpp: 24 },
    Xrgb8888 { bpp: 32 },
    Argb8888 { bpp: 32 },
    Xbgr8888 { bpp: 32 },
    Abgr8888 { bpp: 32 },
    Rgbx8888 { bpp: 32 },
    Rgba8888 { bpp: 32 },
    Bgrx8888 { bpp: 32 },
    Bgra8888 { bpp: 32 },
    Xrgb2101010 { bpp: 32 },
    Argb2101010 { bpp: 32 },
    Xbgr2101010 { bpp: 32 },
    Abgr2101010 { bpp: 32 },
}

/// Error returned when a device-reported format has no surface equivalent
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The fourcc code is not a known DRM format
    #[error("Unrecognized fourcc code: {0:#010x}")]
    Unrecognized(u32),
    /// The format is known but cannot back a display surface
    #[error("Unsupported surface format: {0}")]
    Unsupported(Fourcc),
}

impl From<UnrecognizedFourcc> for FormatError {
    fn from(err: UnrecognizedFourcc) -> Self {
        FormatError::Unrecognized(err.0)
    }
}

/// Translate a raw DRM fourcc code into a supported surface format.
pub fn resolve(drm_format: u32) -> Result<Fourcc, FormatError> {
    let fourcc = Fourcc::try_from(drm_format)?;
    if is_supported(fourcc) {
        Ok(fourcc)
    } else {
        Err(FormatError::Unsupported(fourcc))
    }
}

//! Region based display updates.
//!
//! Devices using the [`Region`](crate::device::Transport::Region) transport
//! keep their primary plane in a region of device memory. The region is
//! mapped into the host once and a [`DisplaySurface`] reading the pixels in
//! place is handed to the console.
//!
//! A [`RegionDisplay`] moves between three states:
//!
//! - *unmapped*: nothing is mapped, the initial state,
//! - *mapped*: the region is mapped, but no surface is built on top of it,
//! - *surfaced*: the console shows a surface backed by the mapping.
//!
//! A change of region index unmaps the old region. A change of geometry or
//! format within the same region only rebuilds the surface.

use std::ptr::{self, NonNull};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, trace, warn};

use super::UpdateOutcome;
use crate::console::{Console, DisplaySurface, SurfaceError};
use crate::device::{DeviceError, GfxDevice, PlaneInfo, PlaneKind, RegionFlags};
use crate::format::{self, Fourcc};

/// Errors thrown while mapping a device region
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Looking up the region failed
    #[error("Failed to look up region")]
    Device(#[from] DeviceError),
    /// The region cannot be mapped for reading
    #[error("Region {index} is not mappable ({flags:?})")]
    NotMappable {
        /// Index of the region
        index: u32,
        /// Capabilities of the region
        flags: RegionFlags,
    },
    /// The region does not fit into the address space
    #[error("Region {index} of {size} bytes is too large to map")]
    TooLarge {
        /// Index of the region
        index: u32,
        /// Size of the region
        size: u64,
    },
    /// The mmap call failed
    #[error("Failed to mmap region {index}")]
    Mmap {
        /// Index of the region
        index: u32,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The region was mapped to an invalid address
    #[error("Region {0} was mapped at a null address")]
    NullMapping(u32),
}

/// A device region mapped read-only into the host
///
/// The mapping is released on drop.
#[derive(Debug)]
pub struct RegionMapping {
    ptr: NonNull<u8>,
    len: usize,
    index: u32,
}

impl RegionMapping {
    /// Map the region `index` of `device`
    pub fn new<D: GfxDevice + ?Sized>(device: &D, index: u32) -> Result<RegionMapping, MapError> {
        let info = device.region_info(index)?;
        let required = RegionFlags::READ | RegionFlags::MMAP;
        if !info.flags.contains(required) || info.size == 0 {
            return Err(MapError::NotMappable {
                index,
                flags: info.flags,
            });
        }
        let len = usize::try_from(info.size).map_err(|_| MapError::TooLarge { index, size: info.size })?;

        // SAFETY: we request a fresh shared mapping at an address of the kernel's
        // choosing, so no existing memory is affected.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::SHARED,
                device.as_fd(),
                info.offset,
            )
        }
        .map_err(|errno| MapError::Mmap {
            index,
            source: errno.into(),
        })?;

        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(MapError::NullMapping(index));
        };
        debug!(index, len, offset = info.offset, "mapped display region");
        Ok(RegionMapping { ptr, len, index })
    }

    /// Index of the mapped region
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty, which never happens for a valid mapping
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn surface(&self, plane: &PlaneInfo, format: Fourcc) -> Result<DisplaySurface, SurfaceError> {
        // SAFETY: `RegionBuffer` drops its surface before the mapping backing it
        unsafe { DisplaySurface::from_raw_parts(self.ptr, self.len, plane.size, plane.stride, format) }
    }
}

impl Drop for RegionMapping {
    fn drop(&mut self) {
        trace!(index = self.index, "unmapping display region");
        // SAFETY: ptr and len describe a mapping created in `RegionMapping::new`
        // that no surface refers to anymore.
        let _ = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

// Field order matters: the surface points into the mapping and has to be
// dropped first.
#[derive(Debug)]
struct RegionBuffer {
    surface: Option<DisplaySurface>,
    mapping: RegionMapping,
}

/// Display controller for devices exporting their primary plane in a region
#[derive(Debug, Default)]
pub struct RegionDisplay {
    buffer: Option<RegionBuffer>,
    // the console was handed a surface that it may still read from
    presented: bool,
}

impl RegionDisplay {
    /// Create a controller in unmapped state
    pub fn new() -> RegionDisplay {
        RegionDisplay::default()
    }

    /// The current mapping, if any
    pub fn mapping(&self) -> Option<&RegionMapping> {
        self.buffer.as_ref().map(|buffer| &buffer.mapping)
    }

    /// The current surface, if any
    pub fn surface(&self) -> Option<&DisplaySurface> {
        self.buffer.as_ref().and_then(|buffer| buffer.surface.as_ref())
    }

    /// Present the current region plane of `device` on `console`
    pub fn update<D, C>(&mut self, device: &D, console: &mut C) -> UpdateOutcome
    where
        D: GfxDevice + ?Sized,
        C: Console + ?Sized,
    {
        let plane = match device.query_plane(PlaneKind::Region) {
            Ok(plane) => plane,
            Err(err) => {
                warn!(?err, "failed to query region plane");
                return UpdateOutcome::Skipped;
            }
        };
        if plane.is_empty() {
            return UpdateOutcome::Inactive;
        }
        let format = match format::resolve(plane.drm_format) {
            Ok(format) => format,
            Err(err) => {
                trace!(%err, "ignoring region plane");
                return UpdateOutcome::Skipped;
            }
        };

        if self
            .buffer
            .as_ref()
            .is_some_and(|buffer| buffer.mapping.index() != plane.id)
        {
            debug!(index = plane.id, "display region changed");
            self.buffer = None;
        }

        if let Some(buffer) = self.buffer.as_mut() {
            if buffer.surface.as_ref().is_some_and(|surface| {
                surface.size() != plane.size || surface.stride() != plane.stride || surface.format() != format
            }) {
                debug!(size = ?plane.size, stride = plane.stride, %format, "display surface changed");
                buffer.surface = None;
            }
        }

        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => match RegionMapping::new(device, plane.id) {
                Ok(mapping) => RegionBuffer {
                    surface: None,
                    mapping,
                },
                Err(err) => {
                    warn!(index = plane.id, ?err, "failed to map display region");
                    self.detach(console);
                    return UpdateOutcome::Skipped;
                }
            },
        };
        let buffer = self.buffer.insert(buffer);

        if buffer.surface.is_none() {
            match buffer.mapping.surface(&plane, format) {
                Ok(surface) => {
                    debug!(?surface, "new display surface");
                    console.replace_surface(&surface);
                    self.presented = true;
                    buffer.surface = Some(surface);
                }
                Err(err) => {
                    warn!(index = plane.id, ?err, "plane does not fit display region");
                    self.buffer = None;
                    self.detach(console);
                    return UpdateOutcome::Skipped;
                }
            }
        }

        if let Some(surface) = buffer.surface.as_ref() {
            console.update(surface.geometry());
        }
        UpdateOutcome::Presented
    }

    // The console may still hold a surface whose memory is gone.
    fn detach<C: Console + ?Sized>(&mut self, console: &mut C) {
        if self.presented && self.surface().is_none() {
            console.scanout_disable();
            self.presented = false;
        }
    }

    /// Disable scanout and unmap the region
    ///
    /// Does nothing and returns `false` if no region is mapped.
    pub fn reset<C: Console + ?Sized>(&mut self, console: &mut C) -> bool {
        if self.buffer.is_none() {
            return false;
        }

        console.scanout_disable();
        self.flush();
        console.update_full();
        true
    }

    /// Drop the surface and unmap the region
    pub fn flush(&mut self) {
        self.buffer = None;
        self.presented = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{MapError, RegionDisplay, RegionMapping};
    use crate::console::test::{ConsoleCall, RecordingConsole};
    use crate::device::test::{region_plane, DummyDevice};
    use crate::device::{PlaneKind, RegionFlags};
    use crate::display::UpdateOutcome;
    use crate::format::Fourcc;
    use crate::utils::{Rectangle, Size};

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn first_frame_maps_and_surfaces() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(2, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(2, Size::new(640, 480), Fourcc::Xrgb8888));

        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Presented);
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Presented);

        assert_eq!(device.region_lookups(), 1);
        assert_eq!(display.mapping().map(|m| m.index()), Some(2));
        assert_eq!(console.surfaces(), vec![Size::new(640, 480)]);
        assert_eq!(
            console.count(|c| *c == ConsoleCall::Update(Rectangle::from_size((640, 480)))),
            2
        );
    }

    #[test]
    fn surface_sees_region_contents() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.write_region(0, 0, &[0xaa, 0xbb, 0xcc, 0xdd]);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(64, 64), Fourcc::Argb8888));
        display.update(&device, &mut console);

        let surface = display.surface().unwrap();
        assert_eq!(&surface.data()[..4], &[0xaa, 0xbb, 0xcc, 0xdd]);

        device.write_region(0, 0, &[0x11]);
        assert_eq!(surface.data()[0], 0x11);
    }

    #[test]
    fn resize_keeps_mapping() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);

        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(800, 600), Fourcc::Xrgb8888));
        display.update(&device, &mut console);

        assert_eq!(device.region_lookups(), 1, "resize must not remap");
        assert_eq!(console.surfaces(), vec![Size::new(640, 480), Size::new(800, 600)]);
        assert_eq!(display.surface().map(|s| s.size()), Some(Size::new(800, 600)));
    }

    #[test]
    fn format_change_rebuilds_surface() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Rgb565));
        display.update(&device, &mut console);

        assert_eq!(device.region_lookups(), 1);
        assert_eq!(console.count(|c| matches!(c, ConsoleCall::ReplaceSurface { .. })), 2);
        assert_eq!(display.surface().map(|s| s.format()), Some(Fourcc::Rgb565));
    }

    #[test]
    fn region_change_remaps() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.add_region(1, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);

        device.set_plane(PlaneKind::Region, region_plane(1, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);

        assert_eq!(device.region_lookups(), 2);
        assert_eq!(display.mapping().map(|m| m.index()), Some(1));
        assert_eq!(console.surfaces(), vec![Size::new(640, 480), Size::new(640, 480)]);
    }

    #[test]
    fn unsupported_format_keeps_surface() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);
        console.clear();

        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Nv12));
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);

        assert!(console.calls().is_empty());
        assert_eq!(display.surface().map(|s| s.format()), Some(Fourcc::Xrgb8888));
    }

    #[test]
    fn query_failure_keeps_state() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);

        device.fail_plane(PlaneKind::Region);
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);
        assert!(display.surface().is_some());
    }

    #[test]
    fn inactive_plane() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Inactive);
        assert!(display.mapping().is_none());
    }

    #[test]
    fn mapping_failure_is_retried() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region_with_flags(0, 4 * MIB, RegionFlags::READ);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);
        assert!(display.mapping().is_none());
        assert!(console.calls().is_empty());

        device.add_region(0, 4 * MIB);
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Presented);
        assert_eq!(device.region_lookups(), 2);
    }

    #[test]
    fn failed_remap_detaches_console() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);
        console.clear();

        // region 1 does not exist
        device.set_plane(PlaneKind::Region, region_plane(1, Size::new(640, 480), Fourcc::Xrgb8888));
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);
        assert!(display.mapping().is_none());
        assert_eq!(console.calls(), &[ConsoleCall::ScanoutDisable]);
    }

    #[test]
    fn oversized_plane_is_rejected() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(1920, 1080), Fourcc::Xrgb8888));
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);
        assert!(display.mapping().is_none());
        assert!(console.calls().is_empty());

        // the whole setup is retried on the next tick
        display.update(&device, &mut console);
        assert_eq!(device.region_lookups(), 2);
    }

    #[test]
    fn shrinking_region_detaches_console() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);
        console.clear();

        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(1920, 1080), Fourcc::Xrgb8888));
        assert_eq!(display.update(&device, &mut console), UpdateOutcome::Skipped);
        assert_eq!(console.calls(), &[ConsoleCall::ScanoutDisable]);
        assert!(display.mapping().is_none());
    }

    #[test]
    fn missing_region() {
        let device = DummyDevice::new();
        assert!(matches!(RegionMapping::new(&device, 7), Err(MapError::Device(_))));
    }

    #[test]
    fn reset_unmaps() {
        let device = DummyDevice::new();
        let mut console = RecordingConsole::new();
        let mut display = RegionDisplay::new();

        assert!(!display.reset(&mut console));

        device.add_region(0, 4 * MIB);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));
        display.update(&device, &mut console);
        console.clear();

        assert!(display.reset(&mut console));
        assert!(display.mapping().is_none());
        assert_eq!(console.calls(), &[ConsoleCall::ScanoutDisable, ConsoleCall::UpdateFull]);

        display.update(&device, &mut console);
        assert_eq!(device.region_lookups(), 2);
    }
}

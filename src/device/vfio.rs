//! [`GfxDevice`] implementation for Linux VFIO mediated devices.
//!
//! Uses the `VFIO_DEVICE_QUERY_GFX_PLANE` and `VFIO_DEVICE_GET_GFX_DMABUF`
//! ioctls of the vfio-mdev display interface, and `VFIO_DEVICE_GET_REGION_INFO`
//! to locate region-backed planes.

#![forbid(unsafe_op_in_unsafe_fn)]

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use tracing::trace;

use super::{DeviceError, GfxDevice, PlaneInfo, PlaneKind, RegionFlags, RegionInfo, Transport};
use crate::utils::{Point, Size};

const VFIO_TYPE: libc::c_ulong = b';' as libc::c_ulong;
const VFIO_BASE: libc::c_ulong = 100;

/// `_IO(VFIO_TYPE, VFIO_BASE + nr)`
const fn vfio_io(nr: libc::c_ulong) -> libc::c_ulong {
    (VFIO_TYPE << 8) | (VFIO_BASE + nr)
}

const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = vfio_io(8);
const VFIO_DEVICE_QUERY_GFX_PLANE: libc::c_ulong = vfio_io(14);
const VFIO_DEVICE_GET_GFX_DMABUF: libc::c_ulong = vfio_io(15);

const VFIO_GFX_PLANE_TYPE_PROBE: u32 = 1 << 0;
const VFIO_GFX_PLANE_TYPE_DMABUF: u32 = 1 << 1;
const VFIO_GFX_PLANE_TYPE_REGION: u32 = 1 << 2;

const DRM_PLANE_TYPE_PRIMARY: u32 = 1;
const DRM_PLANE_TYPE_CURSOR: u32 = 2;

#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Debug, Default, Clone, Copy)]
struct vfio_device_gfx_plane_info {
    argsz: u32,
    flags: u32,
    drm_plane_type: u32,
    drm_format: u32,
    drm_format_mod: u64,
    width: u32,
    height: u32,
    stride: u32,
    size: u32,
    x_pos: u32,
    y_pos: u32,
    x_hot: u32,
    y_hot: u32,
    /// `region_index` or `dmabuf_id`, depending on the plane type
    id: u32,
    reserved: u32,
}

impl vfio_device_gfx_plane_info {
    fn new(flags: u32, drm_plane_type: u32) -> Self {
        vfio_device_gfx_plane_info {
            argsz: std::mem::size_of::<Self>() as u32,
            flags,
            drm_plane_type,
            ..Default::default()
        }
    }
}

impl From<vfio_device_gfx_plane_info> for PlaneInfo {
    fn from(plane: vfio_device_gfx_plane_info) -> Self {
        PlaneInfo {
            drm_format: plane.drm_format,
            drm_format_mod: plane.drm_format_mod,
            size: Size::new(plane.width, plane.height),
            stride: plane.stride,
            byte_size: plane.size,
            position: Point::new(plane.x_pos, plane.y_pos),
            hotspot: Point::new(plane.x_hot, plane.y_hot),
            id: plane.id,
        }
    }
}

#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Debug, Default, Clone, Copy)]
struct vfio_region_info {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

/// An opened VFIO device
///
/// Wraps the device file descriptor obtained from the VFIO group
/// (`VFIO_GROUP_GET_DEVICE_FD`) or the device cdev.
#[derive(Debug)]
pub struct VfioDevice {
    fd: OwnedFd,
}

impl VfioDevice {
    /// Wrap an opened VFIO device file descriptor
    pub fn new(fd: OwnedFd) -> Self {
        VfioDevice { fd }
    }

    fn query(&self, plane: &mut vfio_device_gfx_plane_info) -> io::Result<()> {
        // SAFETY: the fd is valid for the lifetime of self and `plane` is a
        // properly sized and initialized `vfio_device_gfx_plane_info`.
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                VFIO_DEVICE_QUERY_GFX_PLANE as _,
                plane as *mut vfio_device_gfx_plane_info,
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl AsFd for VfioDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl GfxDevice for VfioDevice {
    fn probe(&self, transport: Transport) -> Result<(), DeviceError> {
        let (flags, kind) = match transport {
            Transport::Dmabuf => (VFIO_GFX_PLANE_TYPE_DMABUF, PlaneKind::Primary),
            Transport::Region => (VFIO_GFX_PLANE_TYPE_REGION, PlaneKind::Region),
        };
        let mut probe = vfio_device_gfx_plane_info::new(VFIO_GFX_PLANE_TYPE_PROBE | flags, 0);
        self.query(&mut probe)
            .map_err(|source| DeviceError::Query { kind, source })?;
        trace!(?transport, "device supports display transport");
        Ok(())
    }

    fn query_plane(&self, kind: PlaneKind) -> Result<PlaneInfo, DeviceError> {
        let flags = match kind.transport() {
            Transport::Dmabuf => VFIO_GFX_PLANE_TYPE_DMABUF,
            Transport::Region => VFIO_GFX_PLANE_TYPE_REGION,
        };
        let plane_type = match kind {
            PlaneKind::Cursor => DRM_PLANE_TYPE_CURSOR,
            PlaneKind::Primary | PlaneKind::Region => DRM_PLANE_TYPE_PRIMARY,
        };
        let mut plane = vfio_device_gfx_plane_info::new(flags, plane_type);
        self.query(&mut plane)
            .map_err(|source| DeviceError::Query { kind, source })?;
        Ok(plane.into())
    }

    fn get_dmabuf(&self, id: u32) -> Result<OwnedFd, DeviceError> {
        let mut dmabuf_id = id;
        // SAFETY: the fd is valid for the lifetime of self and the ioctl takes a
        // pointer to the u32 dmabuf id.
        let fd = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                VFIO_DEVICE_GET_GFX_DMABUF as _,
                &mut dmabuf_id as *mut u32,
            )
        };
        if fd < 0 {
            return Err(DeviceError::Fetch {
                id,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: on success the ioctl returns a newly opened fd we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError> {
        let mut info = vfio_region_info {
            argsz: std::mem::size_of::<vfio_region_info>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: the fd is valid for the lifetime of self and `info` is a
        // properly sized and initialized `vfio_region_info`.
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                VFIO_DEVICE_GET_REGION_INFO as _,
                &mut info as *mut vfio_region_info,
            )
        };
        if ret < 0 {
            return Err(DeviceError::RegionInfo {
                index,
                source: io::Error::last_os_error(),
            });
        }
        Ok(RegionInfo {
            index: info.index,
            flags: RegionFlags::from_bits_truncate(info.flags),
            size: info.size,
            offset: info.offset,
        })
    }
}

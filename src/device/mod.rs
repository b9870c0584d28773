//! Plane queries against a mediated graphics device.
//!
//! A mediated device exports the contents of its display engine in one of two
//! ways: as shareable dmabufs (one per plane, identified by a device-assigned
//! id) or as a region of device memory the host can map. The [`GfxDevice`]
//! trait abstracts the three operations needed to follow those planes:
//! probing which [`Transport`] is available, querying the current
//! [`PlaneInfo`] of a [`PlaneKind`] and fetching the file descriptor of a
//! dmabuf.
//!
//! The Linux VFIO implementation lives in [`vfio`].

use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;

use crate::format::{Fourcc, Modifier};
use crate::utils::{Point, Size};

#[cfg(feature = "backend_vfio")]
pub mod vfio;

/// Value of a hotspot coordinate if the cursor plane does not define one
pub const HOTSPOT_UNDEFINED: u32 = u32::MAX;

/// Transport a device uses to export its planes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Planes are exported as dmabufs
    Dmabuf,
    /// The primary plane lives in a mappable device region
    Region,
}

/// Kind of plane to query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneKind {
    /// The primary plane, exported as a dmabuf
    Primary,
    /// The cursor plane, exported as a dmabuf
    Cursor,
    /// The primary plane, located in a device region
    Region,
}

impl PlaneKind {
    /// Transport this kind of plane is exported with
    pub fn transport(&self) -> Transport {
        match self {
            PlaneKind::Primary | PlaneKind::Cursor => Transport::Dmabuf,
            PlaneKind::Region => Transport::Region,
        }
    }
}

/// Description of a plane as reported by the device for the current frame
///
/// A plane with a zero format or size is not active, see [`PlaneInfo::is_empty`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Raw DRM fourcc code of the plane
    pub drm_format: u32,
    /// Raw DRM format modifier of the plane
    pub drm_format_mod: u64,
    /// Dimensions in pixels
    pub size: Size<u32>,
    /// Bytes per line
    pub stride: u32,
    /// Size of the plane in bytes
    pub byte_size: u32,
    /// Position of the plane, only meaningful for cursor planes
    pub position: Point<u32>,
    /// Hotspot of the plane, only meaningful for cursor planes
    ///
    /// Either coordinate is [`HOTSPOT_UNDEFINED`] if the cursor has no hotspot.
    pub hotspot: Point<u32>,
    /// Dmabuf id for dmabuf planes, region index for region planes
    pub id: u32,
}

impl PlaneInfo {
    /// Returns true if the device does not show a plane of the queried kind
    pub fn is_empty(&self) -> bool {
        self.drm_format == 0 || self.byte_size == 0 || self.size.is_empty()
    }

    /// The plane format, if it is a known DRM format
    pub fn fourcc(&self) -> Option<Fourcc> {
        Fourcc::try_from(self.drm_format).ok()
    }

    /// The plane format modifier
    pub fn modifier(&self) -> Modifier {
        Modifier::from(self.drm_format_mod)
    }
}

bitflags::bitflags! {
    /// Capabilities of a device region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// The region supports read access
        const READ = 1 << 0;
        /// The region supports write access
        const WRITE = 1 << 1;
        /// The region supports mmap
        const MMAP = 1 << 2;
        /// The region info carries a capability chain
        const CAPS = 1 << 3;
    }
}

/// Location and capabilities of a device region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Index of the region
    pub index: u32,
    /// Capabilities of the region
    pub flags: RegionFlags,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset of the region inside the device file descriptor
    pub offset: u64,
}

/// Errors returned by a [`GfxDevice`]
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Querying a plane failed
    #[error("Failed to query {kind:?} plane")]
    Query {
        /// Kind of plane queried
        kind: PlaneKind,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Fetching the file descriptor of a dmabuf failed
    #[error("Failed to fetch dmabuf {id}")]
    Fetch {
        /// Dmabuf id requested
        id: u32,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Looking up a device region failed
    #[error("Failed to get info of region {index}")]
    RegionInfo {
        /// Region index requested
        index: u32,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The device does not offer the requested operation
    #[error("Operation is not supported by the device")]
    Unsupported,
}

/// A device exporting its display planes
///
/// The file descriptor returned by [`AsFd`] is the one device regions are
/// mapped from.
pub trait GfxDevice: AsFd {
    /// Check whether the device exports its planes through `transport`
    fn probe(&self, transport: Transport) -> Result<(), DeviceError>;

    /// Query the current state of a plane
    ///
    /// An inactive plane is reported as an empty [`PlaneInfo`], not as an error.
    fn query_plane(&self, kind: PlaneKind) -> Result<PlaneInfo, DeviceError>;

    /// Open a new file descriptor for the dmabuf with the given id
    fn get_dmabuf(&self, id: u32) -> Result<OwnedFd, DeviceError>;

    /// Look up the region with the given index
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError>;
}

impl<T: GfxDevice + ?Sized> GfxDevice for &T {
    #[inline]
    fn probe(&self, transport: Transport) -> Result<(), DeviceError> {
        (**self).probe(transport)
    }
    #[inline]
    fn query_plane(&self, kind: PlaneKind) -> Result<PlaneInfo, DeviceError> {
        (**self).query_plane(kind)
    }
    #[inline]
    fn get_dmabuf(&self, id: u32) -> Result<OwnedFd, DeviceError> {
        (**self).get_dmabuf(id)
    }
    #[inline]
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError> {
        (**self).region_info(index)
    }
}

impl<T: GfxDevice + ?Sized> GfxDevice for Rc<T> {
    #[inline]
    fn probe(&self, transport: Transport) -> Result<(), DeviceError> {
        (**self).probe(transport)
    }
    #[inline]
    fn query_plane(&self, kind: PlaneKind) -> Result<PlaneInfo, DeviceError> {
        (**self).query_plane(kind)
    }
    #[inline]
    fn get_dmabuf(&self, id: u32) -> Result<OwnedFd, DeviceError> {
        (**self).get_dmabuf(id)
    }
    #[inline]
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError> {
        (**self).region_info(index)
    }
}

impl<T: GfxDevice + ?Sized> GfxDevice for Arc<T> {
    #[inline]
    fn probe(&self, transport: Transport) -> Result<(), DeviceError> {
        (**self).probe(transport)
    }
    #[inline]
    fn query_plane(&self, kind: PlaneKind) -> Result<PlaneInfo, DeviceError> {
        (**self).query_plane(kind)
    }
    #[inline]
    fn get_dmabuf(&self, id: u32) -> Result<OwnedFd, DeviceError> {
        (**self).get_dmabuf(id)
    }
    #[inline]
    fn region_info(&self, index: u32) -> Result<RegionInfo, DeviceError> {
        (**self).region_info(index)
    }
}

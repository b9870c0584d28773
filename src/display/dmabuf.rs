//! Dmabuf based display updates.
//!
//! Devices using the [`Dmabuf`](crate::device::Transport::Dmabuf) transport
//! export every plane they show as a dmabuf, identified by a device-assigned
//! id. The id stays the same for as long as the guest keeps showing the same
//! buffer, so a guest flipping between a few framebuffers only ever exports
//! a handful of distinct ids.
//!
//! [`DmabufCache`] keeps the file descriptors of recently seen ids open, so
//! a flip back to a known buffer neither opens a new fd nor forces the console
//! to import the buffer again. [`DmabufDisplay`] drives the cache once per
//! frame and tells the console about primary plane flips and cursor changes.
//!
//! ## Cursor tracking
//!
//! Cursor planes carry a hotspot and a position in addition to their image.
//! Both are tracked per cached buffer with a counter of pending updates,
//! which lets a pure pointer movement be forwarded with a cheap
//! [`cursor_position`](Console::cursor_position) call instead of rebinding
//! the cursor image.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::UpdateOutcome;
use crate::console::Console;
use crate::device::{GfxDevice, PlaneInfo, PlaneKind, HOTSPOT_UNDEFINED};
use crate::format::{Fourcc, Modifier};
use crate::utils::{Point, Rectangle, Size};

/// Amount of most recently used dmabufs kept open after a binding changed
pub const DMABUF_CACHE_KEEP: usize = 5;

/// Hotspot and position of a buffer used as cursor image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorState {
    hotspot: Point<u32>,
    position: Point<u32>,
    hot_updates: u32,
    pos_updates: u32,
}

impl CursorState {
    fn new(plane: &PlaneInfo) -> CursorState {
        CursorState {
            hotspot: plane.hotspot,
            position: plane.position,
            hot_updates: 0,
            // a fresh cursor image has to be placed
            pos_updates: 1,
        }
    }

    fn update(&mut self, plane: &PlaneInfo) {
        if self.position != plane.position {
            self.position = plane.position;
            self.pos_updates += 1;
        }
        if self.hotspot != plane.hotspot {
            self.hotspot = plane.hotspot;
            self.hot_updates += 1;
        }
    }

    /// Last known hotspot, if the device defines one
    pub fn hotspot(&self) -> Option<Point<u32>> {
        if self.hotspot.x == HOTSPOT_UNDEFINED || self.hotspot.y == HOTSPOT_UNDEFINED {
            None
        } else {
            Some(self.hotspot)
        }
    }

    /// Last known position
    pub fn position(&self) -> Point<u32> {
        self.position
    }

    /// Hotspot changes not yet forwarded to the console
    pub fn pending_hotspot_updates(&self) -> u32 {
        self.hot_updates
    }

    /// Position changes not yet forwarded to the console
    pub fn pending_position_updates(&self) -> u32 {
        self.pos_updates
    }
}

/// A dmabuf exported by the device
///
/// Owns the dmabuf file descriptor, which is closed once the buffer is
/// evicted from the [`DmabufCache`].
#[derive(Debug)]
pub struct DmabufBuffer {
    id: u32,
    size: Size<u32>,
    stride: u32,
    drm_format: u32,
    modifier: Modifier,
    fd: OwnedFd,
    cursor: Option<CursorState>,
}

impl DmabufBuffer {
    fn new(plane: &PlaneInfo, fd: OwnedFd) -> DmabufBuffer {
        DmabufBuffer {
            id: plane.id,
            size: plane.size,
            stride: plane.stride,
            drm_format: plane.drm_format,
            modifier: plane.modifier(),
            fd,
            cursor: None,
        }
    }

    /// Device-assigned id of this buffer
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Dimensions in pixels
    pub fn size(&self) -> Size<u32> {
        self.size
    }

    /// Bytes per line
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Raw DRM fourcc code as reported by the device
    pub fn drm_format(&self) -> u32 {
        self.drm_format
    }

    /// Pixel format, if it is a known DRM format
    pub fn fourcc(&self) -> Option<Fourcc> {
        Fourcc::try_from(self.drm_format).ok()
    }

    /// Format modifier
    pub fn modifier(&self) -> Modifier {
        self.modifier
    }

    /// Cursor state, if this buffer was ever shown on the cursor plane
    pub fn cursor(&self) -> Option<&CursorState> {
        self.cursor.as_ref()
    }
}

impl AsFd for DmabufBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Recency ordered cache of the dmabufs exported by a device
///
/// Buffers are keyed by their device id alone, regardless of the plane they
/// were seen on.
#[derive(Debug, Default)]
pub struct DmabufCache {
    // least recently used first
    bufs: IndexMap<u32, DmabufBuffer>,
    primary: Option<u32>,
    cursor: Option<u32>,
}

impl DmabufCache {
    /// Create an empty cache
    pub fn new() -> DmabufCache {
        DmabufCache::default()
    }

    /// Number of cached buffers
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Returns true if no buffer is cached
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Returns true if a buffer with the given id is cached
    pub fn contains(&self, id: u32) -> bool {
        self.bufs.contains_key(&id)
    }

    /// Look up a cached buffer
    pub fn get(&self, id: u32) -> Option<&DmabufBuffer> {
        self.bufs.get(&id)
    }

    /// Ids of all cached buffers, most recently used first
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.bufs.keys().rev().copied()
    }

    /// The buffer currently scanned out as primary plane
    pub fn primary(&self) -> Option<&DmabufBuffer> {
        self.primary.and_then(|id| self.bufs.get(&id))
    }

    /// The buffer currently used as cursor image
    pub fn cursor(&self) -> Option<&DmabufBuffer> {
        self.cursor.and_then(|id| self.bufs.get(&id))
    }

    /// Query the device for the current plane of `kind` and return its buffer
    ///
    /// Known buffers are moved to the front of the cache, unknown ones are
    /// fetched from the device and inserted. Returns `None` if the plane is
    /// inactive, or if querying or fetching it failed.
    pub fn get_dmabuf<D>(&mut self, device: &D, kind: PlaneKind) -> Option<&DmabufBuffer>
    where
        D: GfxDevice + ?Sized,
    {
        let index = self.lookup(device, kind)?;
        self.bufs.get_index(index).map(|(_, buffer)| buffer)
    }

    // Returns the position of the resolved buffer in `bufs`.
    fn lookup<D: GfxDevice + ?Sized>(&mut self, device: &D, kind: PlaneKind) -> Option<usize> {
        let plane = match device.query_plane(kind) {
            Ok(plane) => plane,
            Err(err) => {
                trace!(?kind, ?err, "plane query failed");
                return None;
            }
        };
        if plane.is_empty() {
            return None;
        }

        if let Some(mut buffer) = self.bufs.shift_remove(&plane.id) {
            trace!(?kind, id = plane.id, "dmabuf cache hit");
            if kind == PlaneKind::Cursor {
                match buffer.cursor.as_mut() {
                    Some(cursor) => cursor.update(&plane),
                    None => buffer.cursor = Some(CursorState::new(&plane)),
                }
            }
            return Some(self.bufs.insert_full(plane.id, buffer).0);
        }

        let fd = match device.get_dmabuf(plane.id) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(?kind, id = plane.id, ?err, "failed to fetch dmabuf");
                return None;
            }
        };

        let mut buffer = DmabufBuffer::new(&plane, fd);
        if kind == PlaneKind::Cursor {
            buffer.cursor = Some(CursorState::new(&plane));
        }
        debug!(
            ?kind,
            id = buffer.id,
            size = ?buffer.size,
            stride = buffer.stride,
            format = ?buffer.fourcc(),
            "new dmabuf"
        );
        Some(self.bufs.insert_full(plane.id, buffer).0)
    }

    /// Release all but the [`DMABUF_CACHE_KEEP`] most recently used buffers
    ///
    /// The buffer bound as primary plane is kept even if it is older.
    pub fn trim<C: Console + ?Sized>(&mut self, console: &mut C) {
        let excess = self.bufs.len().saturating_sub(DMABUF_CACHE_KEEP);
        if excess == 0 {
            return;
        }

        let primary = self.primary;
        let evicted = self
            .bufs
            .keys()
            .take(excess)
            .copied()
            .filter(|&id| Some(id) != primary)
            .collect::<Vec<_>>();
        for id in evicted {
            if let Some(buffer) = self.bufs.shift_remove(&id) {
                self.destroy(console, buffer);
            }
        }
    }

    /// Release every cached buffer
    pub fn flush<C: Console + ?Sized>(&mut self, console: &mut C) {
        self.primary = None;
        self.cursor = None;
        while let Some((_, buffer)) = self.bufs.pop() {
            self.destroy(console, buffer);
        }
    }

    fn destroy<C: Console + ?Sized>(&mut self, console: &mut C, buffer: DmabufBuffer) {
        assert_ne!(self.primary, Some(buffer.id), "released the bound primary dmabuf");
        if self.cursor == Some(buffer.id) {
            self.cursor = None;
        }
        debug!(id = buffer.id, "releasing dmabuf");
        console.release_dmabuf(&buffer);
    }
}

/// Display controller for devices exporting dmabufs
#[derive(Debug, Default)]
pub struct DmabufDisplay {
    cache: DmabufCache,
}

impl DmabufDisplay {
    /// Create a controller with an empty cache
    pub fn new() -> DmabufDisplay {
        DmabufDisplay::default()
    }

    /// The cache of dmabufs exported by the device
    pub fn cache(&self) -> &DmabufCache {
        &self.cache
    }

    /// Present the current primary and cursor planes of `device` on `console`
    pub fn update<D, C>(&mut self, device: &D, console: &mut C) -> UpdateOutcome
    where
        D: GfxDevice + ?Sized,
        C: Console + ?Sized,
    {
        let Some(primary_index) = self.cache.lookup(device, PlaneKind::Primary) else {
            return UpdateOutcome::Inactive;
        };
        let primary = &self.cache.bufs[primary_index];
        let primary_size = primary.size;
        let mut bindings_changed = false;

        if self.cache.primary != Some(primary.id) {
            trace!(id = primary.id, size = ?primary_size, "new primary dmabuf");
            self.cache.primary = Some(primary.id);
            console.resize(primary_size);
            console.scanout_dmabuf(primary);
            bindings_changed = true;
        }

        let cursor_index = self.cache.lookup(device, PlaneKind::Cursor);
        let cursor_id = cursor_index.map(|index| self.cache.bufs[index].id);
        let new_cursor = self.cache.cursor != cursor_id;
        if new_cursor {
            trace!(id = ?cursor_id, "new cursor dmabuf");
            self.cache.cursor = cursor_id;
            bindings_changed = true;
        }

        match cursor_index.and_then(|index| self.cache.bufs.get_index_mut(index)) {
            Some((_, cursor)) => {
                let state = cursor.cursor.unwrap_or_default();
                if new_cursor || state.hot_updates > 0 {
                    console.cursor_dmabuf(cursor, state.hotspot());
                }
                // the console may still place the previous image elsewhere
                if new_cursor || state.pos_updates > 0 {
                    console.cursor_position(state.position);
                }
                if let Some(state) = cursor.cursor.as_mut() {
                    state.hot_updates = 0;
                    state.pos_updates = 0;
                }
            }
            None if new_cursor => console.clear_cursor(),
            None => {}
        }

        console.update(Rectangle::from_size(primary_size));

        if bindings_changed {
            self.cache.trim(console);
        }
        UpdateOutcome::Presented
    }

    /// Disable scanout and release all buffers
    ///
    /// Does nothing and returns `false` if no primary plane was ever bound.
    pub fn reset<C: Console + ?Sized>(&mut self, console: &mut C) -> bool {
        if self.cache.primary.is_none() {
            return false;
        }

        console.scanout_disable();
        self.cache.flush(console);
        console.update_full();
        true
    }

    /// Release all buffers
    pub fn flush<C: Console + ?Sized>(&mut self, console: &mut C) {
        self.cache.flush(console);
    }
}

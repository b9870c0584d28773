//! Display support for mediated graphics devices.
//!
//! A [`VfioDisplay`] follows the planes a device exports and presents them on
//! a host [`Console`]. It is created once the device is attached, which
//! probes the device for a supported [`Transport`] and picks the matching
//! controller:
//!
//! - [`DmabufDisplay`] for devices exporting dmabufs,
//! - [`RegionDisplay`] for devices exporting a mappable memory region.
//!
//! The chosen [`DisplayMethod`] stays fixed until the device is attached
//! again. From then on, the host calls [`VfioDisplay::update`] whenever it
//! wants to present a new frame. The device is queried on every call, so
//! calling it more or less often than the guest flips is fine.
//!
//! ```no_run
//! use std::os::unix::io::OwnedFd;
//!
//! use vfio_display::console::Console;
//! use vfio_display::device::vfio::VfioDevice;
//! use vfio_display::display::{DisplayConfig, VfioDisplay};
//!
//! fn run(device_fd: OwnedFd, console: impl Console) {
//!     let device = VfioDevice::new(device_fd);
//!     let display = VfioDisplay::new(device, console, &DisplayConfig::default())
//!         .expect("display required but not supported");
//!
//!     if let Some(mut display) = display {
//!         loop {
//!             display.update();
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, info_span, instrument, trace};

use crate::console::{Console, Fallback};
use crate::device::{GfxDevice, Transport};

pub mod dmabuf;
pub mod region;

pub use self::dmabuf::{DmabufCache, DmabufDisplay, DMABUF_CACHE_KEEP};
pub use self::region::{MapError, RegionDisplay, RegionMapping};

/// Setting of an optional feature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OnOffAuto {
    /// The feature is required
    On,
    /// The feature is disabled
    Off,
    /// The feature is used if available
    #[default]
    Auto,
}

/// Error returned when parsing an [`OnOffAuto`] value
#[derive(Debug, thiserror::Error)]
#[error("Invalid value `{0}`, expected `on`, `off` or `auto`")]
pub struct ParseOnOffAutoError(String);

impl FromStr for OnOffAuto {
    type Err = ParseOnOffAutoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(OnOffAuto::On),
            "off" => Ok(OnOffAuto::Off),
            "auto" => Ok(OnOffAuto::Auto),
            _ => Err(ParseOnOffAutoError(s.to_owned())),
        }
    }
}

impl fmt::Display for OnOffAuto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnOffAuto::On => "on",
            OnOffAuto::Off => "off",
            OnOffAuto::Auto => "auto",
        })
    }
}

/// Display configuration of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Whether the device display is used
    pub display: OnOffAuto,
}

/// Errors thrown when setting up the display of a device
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The display is required, but the device offers no known transport
    #[error("Device doesn't support any (known) display method")]
    NoDisplayMethod,
    /// The device exports dmabufs, but the console cannot show them
    #[error("Device exports dmabufs, but the console cannot scan them out")]
    DmabufUnsupported,
}

/// The way a device display is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayMethod {
    /// Dmabuf planes, see [`DmabufDisplay`]
    Dmabuf,
    /// Region plane, see [`RegionDisplay`]
    Region,
    /// The device display is not used
    Disabled,
}

/// Choose the display method for `device`
///
/// Dmabufs are preferred over regions. If the device supports neither, the
/// display is disabled in [`OnOffAuto::Auto`] mode and an error otherwise.
pub fn select_method<D: GfxDevice + ?Sized>(
    device: &D,
    config: &DisplayConfig,
) -> Result<DisplayMethod, ConfigError> {
    if config.display == OnOffAuto::Off {
        return Ok(DisplayMethod::Disabled);
    }

    for (transport, method) in [
        (Transport::Dmabuf, DisplayMethod::Dmabuf),
        (Transport::Region, DisplayMethod::Region),
    ] {
        match device.probe(transport) {
            Ok(()) => return Ok(method),
            Err(err) => trace!(?transport, ?err, "display transport not supported"),
        }
    }

    match config.display {
        OnOffAuto::Auto => Ok(DisplayMethod::Disabled),
        _ => Err(ConfigError::NoDisplayMethod),
    }
}

/// Result of a single display update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The device plane was presented
    Presented,
    /// The device shows no plane
    Inactive,
    /// The device plane could not be presented this time
    Skipped,
}

#[derive(Debug)]
enum Controller {
    Dmabuf(DmabufDisplay),
    Region(RegionDisplay),
}

/// Display of an attached device
///
/// Releases every resource it holds on drop, see [`VfioDisplay::finalize`].
pub struct VfioDisplay<D: GfxDevice, C: Console> {
    device: D,
    console: C,
    fallback: Option<Box<dyn Fallback<C>>>,
    controller: Controller,
    closed: bool,
    span: tracing::Span,
}

impl<D: GfxDevice, C: Console> fmt::Debug for VfioDisplay<D, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfioDisplay")
            .field("controller", &self.controller)
            .field("fallback", &self.fallback)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<D: GfxDevice, C: Console> VfioDisplay<D, C> {
    /// Set up the display of `device` on `console`
    ///
    /// Returns `Ok(None)` if the display is disabled, either by `config` or
    /// because the device does not support a known transport.
    pub fn new(device: D, console: C, config: &DisplayConfig) -> Result<Option<Self>, ConfigError> {
        let method = select_method(&device, config)?;
        let controller = match method {
            DisplayMethod::Dmabuf => {
                if !console.supports_dmabuf() {
                    return Err(ConfigError::DmabufUnsupported);
                }
                Controller::Dmabuf(DmabufDisplay::new())
            }
            DisplayMethod::Region => Controller::Region(RegionDisplay::new()),
            DisplayMethod::Disabled => {
                debug!(display = %config.display, "device display disabled");
                return Ok(None);
            }
        };

        let span = info_span!("vfio_display", ?method);
        span.in_scope(|| info!("using device display"));
        Ok(Some(VfioDisplay {
            device,
            console,
            fallback: None,
            controller,
            closed: false,
            span,
        }))
    }

    /// Show `fallback` whenever the device exports no plane
    pub fn with_fallback(mut self, fallback: impl Fallback<C> + 'static) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// The display method in use
    pub fn method(&self) -> DisplayMethod {
        match self.controller {
            Controller::Dmabuf(_) => DisplayMethod::Dmabuf,
            Controller::Region(_) => DisplayMethod::Region,
        }
    }

    /// The device planes are read from
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The console planes are presented on
    pub fn console(&self) -> &C {
        &self.console
    }

    /// Mutable access to the console planes are presented on
    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    /// The dmabuf controller, if dmabufs are used
    pub fn dmabuf(&self) -> Option<&DmabufDisplay> {
        match &self.controller {
            Controller::Dmabuf(dmabuf) => Some(dmabuf),
            Controller::Region(_) => None,
        }
    }

    /// The region controller, if a region is used
    pub fn region(&self) -> Option<&RegionDisplay> {
        match &self.controller {
            Controller::Region(region) => Some(region),
            Controller::Dmabuf(_) => None,
        }
    }

    /// Returns true once [`finalize`](VfioDisplay::finalize) was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Present the current device planes on the console
    ///
    /// Failures are logged and only affect this update.
    #[instrument(level = "trace", parent = &self.span, skip(self))]
    pub fn update(&mut self) -> UpdateOutcome {
        if self.closed {
            return UpdateOutcome::Skipped;
        }

        let outcome = match &mut self.controller {
            Controller::Dmabuf(dmabuf) => dmabuf.update(&self.device, &mut self.console),
            Controller::Region(region) => region.update(&self.device, &mut self.console),
        };

        if outcome == UpdateOutcome::Inactive {
            if let Some(fallback) = self.fallback.as_mut() {
                trace!("no device plane, updating fallback");
                fallback.update(&mut self.console);
            }
        }
        outcome
    }

    /// Drop all bindings after a device reset
    ///
    /// Disables scanout, releases all buffers or the mapped region and
    /// requests a full redraw. Does nothing if nothing was ever shown.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn reset(&mut self) {
        if self.closed {
            return;
        }

        let reset = match &mut self.controller {
            Controller::Dmabuf(dmabuf) => dmabuf.reset(&mut self.console),
            Controller::Region(region) => region.reset(&mut self.console),
        };
        if reset {
            debug!("display reset");
        }
    }

    /// Close the console and release every resource held for the device
    ///
    /// Calling this more than once is harmless.
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn finalize(&mut self) {
        if !self.closed {
            self.console.close();
            self.closed = true;
        }

        match &mut self.controller {
            Controller::Dmabuf(dmabuf) => dmabuf.flush(&mut self.console),
            Controller::Region(region) => region.flush(),
        }
    }
}

impl<D: GfxDevice, C: Console> Drop for VfioDisplay<D, C> {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        select_method, ConfigError, DisplayConfig, DisplayMethod, OnOffAuto, UpdateOutcome, VfioDisplay,
    };
    use crate::console::test::{ConsoleCall, DummyFallback, RecordingConsole};
    use crate::device::test::{cursor_plane, dmabuf_plane, region_plane, DummyDevice};
    use crate::device::{PlaneKind, Transport};
    use crate::format::Fourcc;
    use crate::utils::{Point, Size};

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config(display: OnOffAuto) -> DisplayConfig {
        DisplayConfig { display }
    }

    #[test]
    fn on_off_auto_parsing() {
        assert_eq!("on".parse::<OnOffAuto>().unwrap(), OnOffAuto::On);
        assert_eq!("OFF".parse::<OnOffAuto>().unwrap(), OnOffAuto::Off);
        assert_eq!("Auto".parse::<OnOffAuto>().unwrap(), OnOffAuto::Auto);
        assert!("maybe".parse::<OnOffAuto>().is_err());
        assert_eq!(OnOffAuto::default().to_string(), "auto");
    }

    #[test]
    fn dmabuf_is_preferred() {
        let device = DummyDevice::new();
        assert_eq!(
            select_method(&device, &DisplayConfig::default()).unwrap(),
            DisplayMethod::Dmabuf
        );

        device.set_transports(&[Transport::Region]);
        assert_eq!(
            select_method(&device, &DisplayConfig::default()).unwrap(),
            DisplayMethod::Region
        );
    }

    #[test]
    fn unsupported_device() {
        let device = DummyDevice::new();
        device.set_transports(&[]);

        assert_eq!(
            select_method(&device, &config(OnOffAuto::Auto)).unwrap(),
            DisplayMethod::Disabled
        );
        assert!(matches!(
            select_method(&device, &config(OnOffAuto::On)),
            Err(ConfigError::NoDisplayMethod)
        ));
    }

    #[test]
    fn display_off_skips_probing() {
        let device = DummyDevice::new();
        assert_eq!(
            select_method(&device, &config(OnOffAuto::Off)).unwrap(),
            DisplayMethod::Disabled
        );

        let display = VfioDisplay::new(&device, RecordingConsole::new(), &config(OnOffAuto::Off)).unwrap();
        assert!(display.is_none());
    }

    #[test]
    fn dmabuf_needs_console_support() {
        let device = DummyDevice::new();
        let console = RecordingConsole::without_dmabuf();
        let display = VfioDisplay::new(&device, console, &DisplayConfig::default());
        assert!(matches!(display, Err(ConfigError::DmabufUnsupported)));
    }

    #[test]
    fn failed_setup_releases_nothing() {
        let device = DummyDevice::new();
        device.set_transports(&[]);

        let display = VfioDisplay::new(&device, RecordingConsole::new(), &config(OnOffAuto::On));
        assert!(matches!(display, Err(ConfigError::NoDisplayMethod)));
        assert!(device.fetches().is_empty());
        assert_eq!(device.region_lookups(), 0);
    }

    #[test]
    fn fallback_without_plane() {
        init_logging();
        let device = DummyDevice::new();
        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap()
            .with_fallback(DummyFallback);

        assert_eq!(display.update(), UpdateOutcome::Inactive);
        assert_eq!(display.console().calls(), &[ConsoleCall::FallbackUpdate]);

        device.set_plane(PlaneKind::Primary, dmabuf_plane(1, Size::new(800, 600)));
        assert_eq!(display.update(), UpdateOutcome::Presented);
        assert_eq!(display.console().count(|c| *c == ConsoleCall::FallbackUpdate), 1);
    }

    #[test]
    fn region_fallback_without_plane() {
        let device = DummyDevice::new();
        device.set_transports(&[Transport::Region]);
        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap()
            .with_fallback(DummyFallback);
        assert_eq!(display.method(), DisplayMethod::Region);

        assert_eq!(display.update(), UpdateOutcome::Inactive);
        assert_eq!(display.console().calls(), &[ConsoleCall::FallbackUpdate]);
    }

    #[test]
    fn primary_sequence_end_to_end() {
        init_logging();
        let device = DummyDevice::new();
        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap();

        for id in [0xa, 0xa, 0xb, 0xa, 0xc, 0xd, 0xe, 0xf] {
            device.set_plane(PlaneKind::Primary, dmabuf_plane(id, Size::new(1280, 800)));
            display.update();
        }

        let cache = display.dmabuf().unwrap().cache();
        assert_eq!(cache.ids().collect::<Vec<_>>(), vec![0xf, 0xe, 0xd, 0xc, 0xa]);
        assert_eq!(device.fetches(), vec![0xa, 0xb, 0xc, 0xd, 0xe, 0xf]);
        assert_eq!(
            display.console().scanouts(),
            vec![0xa, 0xb, 0xa, 0xc, 0xd, 0xe, 0xf]
        );
    }

    #[test]
    fn reset_then_update_starts_over() {
        let device = DummyDevice::new();
        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap();

        device.set_plane(PlaneKind::Primary, dmabuf_plane(1, Size::new(800, 600)));
        device.set_plane(PlaneKind::Cursor, cursor_plane(2, Point::new(1, 1), Point::new(0, 0)));
        display.update();
        display.reset();

        assert!(display.dmabuf().unwrap().cache().is_empty());
        assert_eq!(display.console().count(|c| *c == ConsoleCall::ScanoutDisable), 1);

        display.console_mut().clear();
        display.update();
        assert_eq!(display.console().scanouts(), vec![1]);
        assert_eq!(
            display.console().count(|c| matches!(c, ConsoleCall::CursorDmabuf { id: 2, .. })),
            1
        );
    }

    #[test]
    fn finalize_is_idempotent() {
        let device = DummyDevice::new();
        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap();

        device.set_plane(PlaneKind::Primary, dmabuf_plane(1, Size::new(800, 600)));
        device.set_plane(PlaneKind::Cursor, cursor_plane(2, Point::new(1, 1), Point::new(0, 0)));
        display.update();

        display.finalize();
        display.finalize();
        assert!(display.is_closed());
        assert_eq!(display.console().count(|c| *c == ConsoleCall::Close), 1);
        let mut releases = display.console().releases();
        releases.sort_unstable();
        assert_eq!(releases, vec![1, 2]);

        // closed displays stay quiet
        display.console_mut().clear();
        assert_eq!(display.update(), UpdateOutcome::Skipped);
        display.reset();
        assert!(display.console().calls().is_empty());
    }

    #[test]
    fn finalize_region_display() {
        let device = DummyDevice::new();
        device.set_transports(&[Transport::Region]);
        device.add_region(0, 4 * 1024 * 1024);
        device.set_plane(PlaneKind::Region, region_plane(0, Size::new(640, 480), Fourcc::Xrgb8888));

        let mut display = VfioDisplay::new(&device, RecordingConsole::new(), &DisplayConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(display.update(), UpdateOutcome::Presented);
        assert!(display.region().unwrap().mapping().is_some());

        display.finalize();
        assert!(display.region().unwrap().mapping().is_none());
        display.finalize();
        assert_eq!(display.console().count(|c| *c == ConsoleCall::Close), 1);
    }
}

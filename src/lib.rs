#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # vfio-display: scanout of mediated graphics devices
//!
//! This crate presents the display of a mediated (mdev) VFIO graphics device
//! on a host console. The device exports its current planes either as
//! dmabufs or inside a mappable memory region, and the crate keeps the
//! console in sync with whatever the guest shows.
//!
//! ## Structure of the crate
//!
//! - [`device`] abstracts the device behind the [`GfxDevice`](device::GfxDevice)
//!   trait and provides the VFIO ioctl implementation.
//! - [`console`] defines the [`Console`](console::Console) trait the host
//!   display has to implement, and the [`DisplaySurface`](console::DisplaySurface)
//!   handed to it for region based devices.
//! - [`display`] contains the controllers tracking the device planes, and the
//!   [`VfioDisplay`](display::VfioDisplay) tying device and console together.
//! - [`format`] lists the pixel formats understood for region planes.
//!
//! ## Logging
//!
//! The crate makes extensive use of [`tracing`] for its internal logging.
//! Every [`VfioDisplay`](display::VfioDisplay) opens its own span, so
//! messages of multiple devices can be told apart.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod console;
pub mod device;
pub mod display;
pub mod format;
pub mod utils;

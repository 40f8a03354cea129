//! SD/MMC driver stack for the Tegra SDMMC controllers: the SD host
//! standard engine, per-port calibration and power, and the eMMC, SD card
//! and game-card ASIC device protocols on top.
//!
//! Firmware registers its [`hal::Platform`] hooks once, then drives each
//! slot through the functions in [`port`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

pub mod accessor;
mod clkrst;
pub mod detector;
pub mod device;
pub mod error;
pub mod hal;
pub mod host;
pub mod port;
mod timer;

pub use error::{SdError, SdResult};
pub use hal::{init_platform, Platform};
pub use host::{BusPower, BusWidth, SpeedMode, SECTOR_SIZE};
pub use port::{Port, PortConfig};

//! Logical ports. Each one owns a process-wide accessor for its physical
//! slot behind a `spin::Mutex`; every call locks it for its whole duration.

use crate::accessor::*;
use crate::detector::{Callback, DetectorConfig};
use crate::error::SdResult;
use crate::hal::{Event, PhysAddr, RegBlock};
use crate::host::{BusWidth, PowerControlStrategy, SdmmcController, SdmmcPort, SpeedMode};
use alloc::sync::Arc;
use spin::Mutex;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Port {
    Mmc0,
    SdCard0,
    GcAsic0,
}

impl Port {
    pub fn sdmmc_port(self) -> SdmmcPort {
        match self {
            Port::Mmc0 => SdmmcPort::Sdmmc4,
            Port::SdCard0 => SdmmcPort::Sdmmc1,
            Port::GcAsic0 => SdmmcPort::Sdmmc2,
        }
    }
}

/// Board wiring handed to [`initialize`].
pub struct PortConfig {
    pub register_base: PhysAddr,
    /// Rail control; only the SD card slot has one.
    pub power: Option<PowerControlStrategy>,
    /// Raised by the controller interrupt. Without it every wait polls.
    pub interrupt_event: Option<Arc<dyn Event>>,
    /// Card-detect wiring of the SD card slot.
    pub detector: Option<DetectorConfig>,
}

impl PortConfig {
    pub fn new(port: Port) -> Self {
        Self {
            register_base: port.sdmmc_port().register_base(),
            power: None,
            interrupt_event: None,
            detector: None,
        }
    }
}

type Host = SdmmcController;

lazy_static::lazy_static! {
    static ref MMC0: Mutex<Option<MmcDeviceAccessor<Host>>> = Mutex::new(None);
    static ref SD_CARD0: Mutex<Option<SdCardDeviceAccessor<Host>>> = Mutex::new(None);
    static ref GC_ASIC0: Mutex<Option<GcAsicDeviceAccessor<Host>>> = Mutex::new(None);
}

fn not_initialized(port: Port) -> ! {
    panic!("{:?} is not initialized", port)
}

fn with_mmc<R>(port: Port, f: impl FnOnce(&mut MmcDeviceAccessor<Host>) -> R) -> R {
    assert_eq!(port, Port::Mmc0, "not an MMC port");
    match MMC0.lock().as_mut() {
        Some(acc) => f(acc),
        None => not_initialized(port),
    }
}

fn with_sd_card<R>(port: Port, f: impl FnOnce(&mut SdCardDeviceAccessor<Host>) -> R) -> R {
    assert_eq!(port, Port::SdCard0, "not an SD card port");
    match SD_CARD0.lock().as_mut() {
        Some(acc) => f(acc),
        None => not_initialized(port),
    }
}

fn with_gc_asic<R>(port: Port, f: impl FnOnce(&mut GcAsicDeviceAccessor<Host>) -> R) -> R {
    assert_eq!(port, Port::GcAsic0, "not a GC ASIC port");
    match GC_ASIC0.lock().as_mut() {
        Some(acc) => f(acc),
        None => not_initialized(port),
    }
}

fn with_device<R>(port: Port, f: impl FnOnce(&mut dyn DeviceAccessor<Host = Host>) -> R) -> R {
    match port {
        Port::Mmc0 => with_mmc(port, |acc| f(acc)),
        Port::SdCard0 => with_sd_card(port, |acc| f(acc)),
        Port::GcAsic0 => with_gc_asic(port, |acc| f(acc)),
    }
}

/// Second half of a card removal, run on the detector thread after the
/// removed event has been signalled.
fn handle_sd_card_removed() {
    if let Some(acc) = SD_CARD0.lock().as_mut() {
        acc.handle_removed();
    }
}

#[cfg(feature = "sd-card-detector")]
fn attach_detector(acc: SdCardDeviceAccessor<Host>, config: Option<DetectorConfig>) -> SdCardDeviceAccessor<Host> {
    use crate::detector::DeviceDetector;

    match config {
        Some(config) => {
            let on_removed: Callback = Arc::new(handle_sd_card_removed);
            acc.with_detector(DeviceDetector::new(config), on_removed)
        }
        None => acc,
    }
}

#[cfg(not(feature = "sd-card-detector"))]
fn attach_detector(acc: SdCardDeviceAccessor<Host>, config: Option<DetectorConfig>) -> SdCardDeviceAccessor<Host> {
    if config.is_some() {
        warn!("sd: card detection is not built in, ignoring the detector");
    }
    acc
}

pub fn initialize(port: Port, config: PortConfig) {
    let mut host = SdmmcController::with_registers(
        port.sdmmc_port(),
        RegBlock::from_raw(config.register_base),
        config.power,
    );
    host.set_interrupt_event(config.interrupt_event);
    match port {
        Port::Mmc0 => MMC0
            .lock()
            .get_or_insert_with(|| MmcDeviceAccessor::new(host))
            .initialize(),
        Port::SdCard0 => {
            let acc = attach_detector(SdCardDeviceAccessor::new(host), config.detector);
            SD_CARD0.lock().get_or_insert(acc).initialize();
        }
        Port::GcAsic0 => GC_ASIC0
            .lock()
            .get_or_insert_with(|| GcAsicDeviceAccessor::new(host))
            .initialize(),
    }
}

pub fn finalize(port: Port) {
    match port {
        Port::Mmc0 => with_mmc(port, |acc| acc.finalize()),
        Port::SdCard0 => with_sd_card(port, |acc| acc.finalize()),
        Port::GcAsic0 => with_gc_asic(port, |acc| acc.finalize()),
    }
}

pub fn activate(port: Port) -> SdResult {
    with_device(port, |acc| acc.activate())
}

pub fn deactivate(port: Port) {
    with_device(port, |acc| acc.deactivate())
}

pub fn read(port: Port, sector_index: u32, num_sectors: u32, buf: &mut [u8]) -> SdResult {
    with_device(port, |acc| acc.read(sector_index, num_sectors, buf))
}

pub fn write(port: Port, sector_index: u32, num_sectors: u32, buf: &[u8]) -> SdResult {
    with_device(port, |acc| acc.write(sector_index, num_sectors, buf))
}

pub fn check_connection(port: Port) -> SdResult<(SpeedMode, BusWidth)> {
    with_device(port, |acc| acc.check_connection())
}

/// Speed mode as the device itself reports it.
pub fn device_speed_mode(port: Port) -> SdResult<SpeedMode> {
    match port {
        Port::Mmc0 => with_mmc(port, |acc| acc.speed_mode()),
        Port::SdCard0 => with_sd_card(port, |acc| acc.speed_mode()),
        Port::GcAsic0 => with_gc_asic(port, |acc| acc.speed_mode()),
    }
}

pub fn memory_capacity(port: Port) -> SdResult<u32> {
    with_device(port, |acc| acc.memory_capacity())
}

pub fn device_status(port: Port) -> SdResult<u32> {
    with_device(port, |acc| acc.device_status())
}

pub fn ocr(port: Port) -> SdResult<u32> {
    with_device(port, |acc| acc.ocr())
}

pub fn rca(port: Port) -> SdResult<u16> {
    with_device(port, |acc| acc.rca())
}

pub fn cid(port: Port, dst: &mut [u8]) -> SdResult {
    let cid = with_device(port, |acc| acc.cid())?;
    dst[..cid.len()].copy_from_slice(&cid);
    Ok(())
}

pub fn csd(port: Port, dst: &mut [u8]) -> SdResult {
    let csd = with_device(port, |acc| acc.csd())?;
    dst[..csd.len()].copy_from_slice(&csd);
    Ok(())
}

pub fn get_and_clear_error_info(port: Port, log_buf: Option<&mut [u8]>) -> (ErrorInfo, usize) {
    with_device(port, |acc| acc.get_and_clear_error_info(log_buf))
}

pub fn put_to_sleep(port: Port) {
    match port {
        Port::Mmc0 => with_mmc(port, |acc| acc.put_to_sleep()),
        Port::SdCard0 => with_sd_card(port, |acc| acc.put_to_sleep()),
        Port::GcAsic0 => with_gc_asic(port, |acc| acc.put_to_sleep()),
    }
}

pub fn awaken(port: Port) -> SdResult {
    match port {
        Port::Mmc0 => {
            with_mmc(port, |acc| acc.awaken());
            Ok(())
        }
        Port::SdCard0 => {
            with_sd_card(port, |acc| acc.awaken());
            Ok(())
        }
        Port::GcAsic0 => with_gc_asic(port, |acc| acc.awaken()),
    }
}

pub fn select_mmc_partition(port: Port, partition: MmcPartition) -> SdResult {
    with_mmc(port, |acc| acc.select_partition(partition))
}

pub fn erase_mmc(port: Port) -> SdResult {
    with_mmc(port, |acc| acc.erase())
}

pub fn mmc_boot_partition_capacity(port: Port) -> SdResult<u32> {
    with_mmc(port, |acc| acc.boot_partition_capacity())
}

pub fn mmc_extended_csd(port: Port, dst: &mut [u8]) -> SdResult {
    with_mmc(port, |acc| acc.extended_csd(dst))
}

pub fn sd_card_protected_area_capacity(port: Port) -> SdResult<u32> {
    with_sd_card(port, |acc| acc.protected_area_capacity())
}

pub fn sd_card_scr(port: Port, dst: &mut [u8]) -> SdResult {
    with_sd_card(port, |acc| acc.scr(dst))
}

pub fn sd_card_switch_function_status(port: Port, dst: &mut [u8], function: SdCardSwitchFunction) -> SdResult {
    with_sd_card(port, |acc| acc.switch_function_status(dst, function))
}

pub fn sd_card_current_consumption(port: Port, speed_mode: SpeedMode) -> SdResult<u16> {
    with_sd_card(port, |acc| acc.current_consumption(speed_mode))
}

pub fn sd_card_status(port: Port, dst: &mut [u8]) -> SdResult {
    with_sd_card(port, |acc| acc.sd_status(dst))
}

pub fn is_sd_card_inserted(port: Port) -> bool {
    with_sd_card(port, |acc| acc.is_inserted())
}

pub fn register_sd_card_detection_event_callback(port: Port, callback: Callback) {
    with_sd_card(port, |acc| acc.register_detection_event_callback(callback))
}

pub fn unregister_sd_card_detection_event_callback(port: Port) {
    with_sd_card(port, |acc| acc.unregister_detection_event_callback())
}

pub fn write_gc_asic_operation(port: Port, op_buf: &[u8]) -> SdResult {
    with_gc_asic(port, |acc| acc.write_operation(op_buf))
}

pub fn finish_gc_asic_operation(port: Port) -> SdResult {
    with_gc_asic(port, |acc| acc.finish_operation())
}

pub fn abort_gc_asic_operation(port: Port) -> SdResult {
    with_gc_asic(port, |acc| acc.abort_operation())
}

pub fn sleep_gc_asic(port: Port) -> SdResult {
    with_gc_asic(port, |acc| acc.sleep())
}

pub fn update_gc_asic_key(port: Port) -> SdResult {
    with_gc_asic(port, |acc| acc.update_key())
}

pub fn signal_gc_removed_event(port: Port) {
    with_gc_asic(port, |acc| acc.signal_removed_event())
}

pub fn clear_gc_removed_event(port: Port) {
    with_gc_asic(port, |acc| acc.clear_removed_event())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_map_to_their_controllers() {
        assert_eq!(Port::Mmc0.sdmmc_port(), SdmmcPort::Sdmmc4);
        assert_eq!(Port::SdCard0.sdmmc_port(), SdmmcPort::Sdmmc1);
        assert_eq!(Port::GcAsic0.sdmmc_port(), SdmmcPort::Sdmmc2);
        let config = PortConfig::new(Port::GcAsic0);
        assert_eq!(config.register_base, 0x700B_0200);
        assert!(config.power.is_none() && config.detector.is_none());
    }

    #[test]
    #[should_panic(expected = "not an MMC port")]
    fn mmc_call_on_the_sd_port() {
        let _ = select_mmc_partition(Port::SdCard0, MmcPartition::BootPartition1);
    }

    #[test]
    #[should_panic(expected = "not a GC ASIC port")]
    fn gc_call_on_the_mmc_port() {
        let _ = update_gc_asic_key(Port::Mmc0);
    }

    #[test]
    #[should_panic(expected = "not an SD card port")]
    fn sd_call_on_the_gc_port() {
        let _ = is_sd_card_inserted(Port::GcAsic0);
    }

    #[test]
    #[should_panic(expected = "is not initialized")]
    fn uninitialized_port_aborts() {
        let _ = activate(Port::GcAsic0);
    }
}

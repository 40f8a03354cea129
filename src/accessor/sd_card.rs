//! SD card identification, UHS-I and switch-function negotiation, and the
//! card-specific register queries.

use super::*;
use crate::detector::{Callback, CallbackInfo, DeviceDetector};
use crate::device::DeviceType;
use crate::hal::{AtomicEvent, Event};
use crate::timer::{wait_clocks, wait_microseconds, wait_milliseconds, ManualTimer};
use aligned::{Aligned, A8};
use alloc::sync::Arc;

pub const SCR_SIZE: usize = 8;
pub const SWITCH_FUNCTION_STATUS_SIZE: usize = 64;
pub const SD_STATUS_SIZE: usize = 64;

const WORK_BUFFER_SIZE: usize = 512;

const OCR_CARD_POWER_UP_STATUS: u32 = 1 << 31;
const OCR_CARD_CAPACITY_STATUS: u32 = 1 << 30;
const OCR_SWITCHING_TO_1_8V_ACCEPTED: u32 = 1 << 24;

const SEND_IF_COND_ARGUMENT: u32 = 0x1AA;
const SEND_IF_COND_ARGUMENT_MASK: u32 = 0xFFF;

/// Highest current a selected access mode may draw, in mA.
const ACCEPTABLE_CURRENT_LIMIT: u16 = 800;

const READY_TIMEOUT_MS: u32 = 3000;
const GET_RCA_TIMEOUT_MS: u32 = 1000;

#[cfg(feature = "sd-uhs-i")]
const STARTUP_PARAMETERS: &[(BusWidth, SpeedMode)] = &[
    (BusWidth::FourBit, SpeedMode::SdSdr104),
    (BusWidth::FourBit, SpeedMode::SdSdr104),
    (BusWidth::FourBit, SpeedMode::SdHighSpeed),
    (BusWidth::FourBit, SpeedMode::SdDefaultSpeed),
    (BusWidth::OneBit, SpeedMode::SdHighSpeed),
];
#[cfg(not(feature = "sd-uhs-i"))]
const STARTUP_PARAMETERS: &[(BusWidth, SpeedMode)] = &[
    (BusWidth::FourBit, SpeedMode::SdHighSpeed),
    (BusWidth::FourBit, SpeedMode::SdHighSpeed),
    (BusWidth::FourBit, SpeedMode::SdDefaultSpeed),
    (BusWidth::OneBit, SpeedMode::SdHighSpeed),
];

/// Function group 1 of CMD6.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
enum AccessMode {
    Default = 0,
    HighSpeed = 1,
    Sdr50 = 2,
    Sdr104 = 3,
    Ddr50 = 4,
}

impl AccessMode {
    fn from_selection(value: u8) -> Option<Self> {
        match value {
            0 => Some(AccessMode::Default),
            1 => Some(AccessMode::HighSpeed),
            2 => Some(AccessMode::Sdr50),
            3 => Some(AccessMode::Sdr104),
            4 => Some(AccessMode::Ddr50),
            _ => None,
        }
    }

    fn for_speed_mode(speed_mode: SpeedMode) -> Self {
        match speed_mode {
            SpeedMode::SdSdr12 | SpeedMode::SdDefaultSpeed => AccessMode::Default,
            SpeedMode::SdSdr25 | SpeedMode::SdHighSpeed => AccessMode::HighSpeed,
            SpeedMode::SdSdr50 => AccessMode::Sdr50,
            SpeedMode::SdSdr104 => AccessMode::Sdr104,
            SpeedMode::SdDdr50 => AccessMode::Ddr50,
            other => panic!("{:?} is not an SD card speed mode", other),
        }
    }
}

/// What [`SdCardDeviceAccessor::switch_function_status`] asks the card.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdCardSwitchFunction {
    CheckSupportedFunction,
    CheckDefault,
    CheckHighSpeed,
    CheckSdr50,
    CheckSdr104,
    CheckDdr50,
}

fn is_less_than_specification_1_1(scr: &[u8]) -> bool {
    scr[0] & 0xF < 1
}

fn sd_bus_widths(scr: &[u8]) -> u8 {
    scr[1] & 0xF
}

fn is_supported_bus_width_4bit(sd_bus_widths: u8) -> bool {
    sd_bus_widths & 0x4 != 0
}

fn send_op_cond_argument(spec_under_2: bool, uhs_i_supported: bool) -> u32 {
    let hcs = if spec_under_2 { 0 } else { 1 << 30 };
    let xpc = if spec_under_2 { 0 } else { 1 << 28 };
    let s18r = if !spec_under_2 && uhs_i_supported { 1 << 24 } else { 0 };
    hcs | xpc | s18r | 0x0010_0000
}

fn is_less_than_csd_version_2(csd: &[u8]) -> bool {
    (csd[14] & 0xC0) >> 6 == 0
}

fn memory_capacity_from_csd(device: &Device) -> u32 {
    let c_size = (u32::from(device.csd_halfword(3) & 0x3FFF) << 8) | (u32::from(device.csd_halfword(2) & 0xFF00) >> 8);
    (1 + c_size) << 10
}

fn is_supported_access_mode(status: &[u8], mode: AccessMode) -> bool {
    status[13] & (1 << mode as u8) != 0
}

fn access_mode_in_function_selection(status: &[u8]) -> u8 {
    status[16] & 0xF
}

fn maximum_current_consumption(status: &[u8]) -> u16 {
    u16::from_be_bytes([status[0], status[1]])
}

fn size_of_protected_area(sd_status: &[u8]) -> u32 {
    u32::from_be_bytes([sd_status[4], sd_status[5], sd_status[6], sd_status[7]])
}

fn current_speed_mode(status: &[u8], is_uhs_i: bool) -> SdResult<SpeedMode> {
    match AccessMode::from_selection(access_mode_in_function_selection(status)) {
        Some(AccessMode::Default) if is_uhs_i => Ok(SpeedMode::SdSdr12),
        Some(AccessMode::Default) => Ok(SpeedMode::SdDefaultSpeed),
        Some(AccessMode::HighSpeed) if is_uhs_i => Ok(SpeedMode::SdSdr25),
        Some(AccessMode::HighSpeed) => Ok(SpeedMode::SdHighSpeed),
        Some(AccessMode::Sdr50) => Ok(SpeedMode::SdSdr50),
        Some(AccessMode::Sdr104) => Ok(SpeedMode::SdSdr104),
        Some(AccessMode::Ddr50) => Ok(SpeedMode::SdDdr50),
        None => Err(SdError::UnexpectedSdCardSwitchFunctionStatus),
    }
}

/// CMD55. The card must acknowledge with APP_CMD set.
fn issue_command_app_cmd<H: HostController>(
    base: &mut BaseDeviceAccessor<H>,
    expected_state: DeviceState,
    ignore: DeviceStatus,
) -> SdResult {
    let argument = u32::from(base.device().rca()) << 16;
    let command = Command::new(cmd::APP_CMD, argument, ResponseType::R1, false);
    base.host_mut().issue_command(&command, None)?;
    let status = base.host().last_response(ResponseType::R1)[0] & !ignore.bits();
    base.device().check_device_status(status)?;
    if status & DeviceStatus::APP_CMD.bits() == 0 {
        return Err(SdError::UnexpectedSdCardAcmdDisabled);
    }
    if expected_state != DeviceState::Unknown && DeviceState::from_status(status) != expected_state {
        return Err(SdError::UnexpectedDeviceState);
    }
    Ok(())
}

/// A register read: R1 command with a single `size`-byte block.
fn issue_command_read_register<H: HostController>(
    base: &mut BaseDeviceAccessor<H>,
    index: u32,
    argument: u32,
    dst: &mut [u8],
    size: usize,
) -> SdResult {
    assert!(dst.len() >= size, "CMD{} needs a {}-byte buffer", index, size);
    let command = Command::new(index, argument, ResponseType::R1, false);
    let mut xfer = TransferData::read(&mut dst[..size], size as u32, 1);
    base.host_mut().issue_command(&command, Some(&mut xfer))?;
    let status = base.host().last_response(ResponseType::R1)[0];
    base.device().check_device_status(status)
}

fn get_scr<H: HostController>(base: &mut BaseDeviceAccessor<H>, dst: &mut [u8]) -> SdResult {
    issue_command_app_cmd(base, DeviceState::Tran, DeviceStatus::empty())?;
    issue_command_read_register(base, cmd::APP_SEND_SCR, 0, dst, SCR_SIZE)
}

fn get_sd_status<H: HostController>(base: &mut BaseDeviceAccessor<H>, dst: &mut [u8]) -> SdResult {
    issue_command_app_cmd(base, DeviceState::Tran, DeviceStatus::empty())?;
    issue_command_read_register(base, cmd::APP_SD_STATUS, 0, dst, SD_STATUS_SIZE)
}

fn issue_command_check_supported_function<H: HostController>(base: &mut BaseDeviceAccessor<H>, dst: &mut [u8]) -> SdResult {
    issue_command_read_register(base, cmd::SWITCH, 0x00FF_FFFF, dst, SWITCH_FUNCTION_STATUS_SIZE)
}

fn issue_command_switch_access_mode<H: HostController>(
    base: &mut BaseDeviceAccessor<H>,
    dst: &mut [u8],
    set_function: bool,
    mode: AccessMode,
) -> SdResult {
    let set_bit = if set_function { 1 << 31 } else { 0 };
    let argument = set_bit | 0x00FF_FFF0 | mode as u32;
    issue_command_read_register(base, cmd::SWITCH, argument, dst, SWITCH_FUNCTION_STATUS_SIZE)
}

/// Check, then set, an access mode, refusing modes that would draw too much
/// current.
fn switch_access_mode<H: HostController>(base: &mut BaseDeviceAccessor<H>, mode: AccessMode, wb: &mut [u8]) -> SdResult {
    issue_command_switch_access_mode(base, wb, false, mode)?;
    if access_mode_in_function_selection(wb) != mode as u8 {
        return Err(SdError::SdCardCannotSwitchAccessMode);
    }
    let current = maximum_current_consumption(wb);
    if current >= ACCEPTABLE_CURRENT_LIMIT {
        debug!("sd: {:?} draws {} mA", mode, current);
        return Err(SdError::SdCardUnacceptableCurrentConsumption);
    }
    issue_command_switch_access_mode(base, wb, true, mode)?;
    if access_mode_in_function_selection(wb) != mode as u8 {
        return Err(SdError::SdCardFailedSwitchAccessMode);
    }
    Ok(())
}

/// Hot-plug wiring: the detector, and what to run once a removal has been
/// signalled.
#[derive(Clone)]
struct Detection {
    detector: Arc<DeviceDetector>,
    on_removed: Callback,
}

pub struct SdCardDeviceAccessor<H> {
    base: BaseDeviceAccessor<H>,
    work_buffer: Aligned<A8, [u8; WORK_BUFFER_SIZE]>,
    max_bus_width: BusWidth,
    max_speed_mode: SpeedMode,
    is_uhs_i_mode: bool,
    is_initialized: bool,
    detection: Option<Detection>,
}

impl<H: HostController> SdCardDeviceAccessor<H> {
    pub fn new(host: H) -> Self {
        let removed_event: Arc<dyn Event> = Arc::new(AtomicEvent::new());
        let device = Device::new(DeviceType::SdCard).with_removed_event(removed_event);
        Self {
            base: BaseDeviceAccessor::new(host, device),
            work_buffer: Aligned([0u8; WORK_BUFFER_SIZE]),
            max_bus_width: STARTUP_PARAMETERS[0].0,
            max_speed_mode: STARTUP_PARAMETERS[0].1,
            is_uhs_i_mode: false,
            is_initialized: false,
            detection: None,
        }
    }

    /// Watch insertion through `detector`. When the card goes away the
    /// removed event is signalled first, then `on_removed` runs; it is
    /// expected to lock this accessor and call [`handle_removed`].
    ///
    /// [`handle_removed`]: SdCardDeviceAccessor::handle_removed
    #[cfg(feature = "sd-card-detector")]
    pub fn with_detector(mut self, detector: Arc<DeviceDetector>, on_removed: Callback) -> Self {
        self.detection = Some(Detection { detector, on_removed });
        self
    }

    fn detector(&self) -> Option<&Arc<DeviceDetector>> {
        self.detection.as_ref().map(|d| &d.detector)
    }

    pub fn initialize(&mut self) {
        if self.is_initialized {
            return;
        }
        if let Some(detection) = self.detection.clone() {
            let event = self.base.device().removed_event();
            self.base.host_mut().set_removed_event(event.clone());
            let on_removed = detection.on_removed;
            let removed: Callback = Arc::new(move || {
                if let Some(event) = &event {
                    event.signal();
                }
                on_removed();
            });
            detection.detector.initialize(CallbackInfo {
                inserted: None,
                removed: Some(removed),
            });
        }
        self.base.host_mut().initialize();
        self.is_initialized = true;
        info!("sd: initialized, detector {}", self.detection.is_some());
    }

    pub fn finalize(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_initialized = false;
        self.deactivate();
        self.base.host_mut().finalize();
        if let Some(detector) = self.detector() {
            detector.finalize();
        }
    }

    /// Second half of the removal callback, run under the device lock.
    pub fn handle_removed(&mut self) {
        self.base.host_mut().shutdown();
    }

    /// Without a detector the card is assumed present.
    pub fn is_inserted(&self) -> bool {
        self.detector().map_or(true, |detector| detector.is_inserted())
    }

    pub fn register_detection_event_callback(&self, callback: Callback) {
        if let Some(detector) = self.detector() {
            detector.register_detection_event_callback(callback);
        }
    }

    pub fn unregister_detection_event_callback(&self) {
        if let Some(detector) = self.detector() {
            detector.unregister_detection_event_callback();
        }
    }

    /// After a failure that looks like the card stopped answering, give the
    /// detector one debounce period to notice a removal.
    fn check_removed_after_debounce(&self, err: SdError) -> SdResult {
        if let Some(detector) = self.detector() {
            if err.is_communication_not_attained() {
                wait_milliseconds(u64::from(detector.debounce_milliseconds()));
                self.base.device().check_removed()?;
            }
        }
        Ok(())
    }

    fn issue_command_send_if_cond(&mut self) -> SdResult {
        let command = Command::new(cmd::SEND_IF_COND, SEND_IF_COND_ARGUMENT, ResponseType::R7, false);
        let host = self.base.host_mut();
        host.issue_command(&command, None)?;
        let response = host.last_response(ResponseType::R7)[0];
        if response & SEND_IF_COND_ARGUMENT_MASK != SEND_IF_COND_ARGUMENT & SEND_IF_COND_ARGUMENT_MASK {
            return Err(SdError::SdCardValidationError);
        }
        Ok(())
    }

    fn issue_command_send_op_cond(&mut self, spec_under_2: bool, uhs_i_supported: bool) -> SdResult<u32> {
        let argument = send_op_cond_argument(spec_under_2, uhs_i_supported);
        let command = Command::new(cmd::APP_SD_SEND_OP_COND, argument, ResponseType::R3, false);
        let host = self.base.host_mut();
        host.issue_command(&command, None)?;
        Ok(host.last_response(ResponseType::R3)[0])
    }

    fn issue_command_send_relative_addr(&mut self) -> SdResult<u16> {
        let command = Command::new(cmd::SEND_RELATIVE_ADDR, 0, ResponseType::R6, false);
        let host = self.base.host_mut();
        host.issue_command(&command, None)?;
        Ok((host.last_response(ResponseType::R6)[0] >> 16) as u16)
    }

    fn enter_uhs_i_mode(&mut self) -> SdResult {
        self.base
            .issue_command_and_check_r1(cmd::VOLTAGE_SWITCH, 0, false, DeviceState::Ready, DeviceStatus::empty())?;
        self.base.host_mut().switch_to_sdr12()
    }

    fn change_to_ready_state(&mut self, spec_under_2: bool, uhs_i_supported: bool) -> SdResult {
        // pre-2.0 cards flag the CMD8 they did not understand on the first CMD55
        let mut ignore = if spec_under_2 {
            DeviceStatus::ILLEGAL_COMMAND
        } else {
            DeviceStatus::empty()
        };
        let mut timer = ManualTimer::new(READY_TIMEOUT_MS);
        loop {
            issue_command_app_cmd(&mut self.base, DeviceState::Unknown, ignore)?;
            ignore = DeviceStatus::empty();
            let ocr = self.issue_command_send_op_cond(spec_under_2, uhs_i_supported)?;
            if ocr & OCR_CARD_POWER_UP_STATUS != 0 {
                let device = self.base.device_mut();
                device.set_ocr(ocr);
                device.set_high_capacity(ocr & OCR_CARD_CAPACITY_STATUS != 0);
                self.is_uhs_i_mode = false;
                if uhs_i_supported && ocr & OCR_SWITCHING_TO_1_8V_ACCEPTED != 0 {
                    self.enter_uhs_i_mode()?;
                    self.is_uhs_i_mode = true;
                }
                return Ok(());
            }
            if !timer.update() {
                debug!("sd: no power-up after {} ms, ocr {:#x}", READY_TIMEOUT_MS, ocr);
                return Err(SdError::SdCardInitializationSoftwareTimeout);
            }
            wait_microseconds(1000);
        }
    }

    fn change_to_stby_state_and_get_rca(&mut self) -> SdResult {
        let mut timer = ManualTimer::new(GET_RCA_TIMEOUT_MS);
        loop {
            let rca = self.issue_command_send_relative_addr()?;
            if rca != 0 {
                self.base.device_mut().set_rca(rca);
                return Ok(());
            }
            if !timer.update() {
                return Err(SdError::SdCardGetValidRcaSoftwareTimeout);
            }
        }
    }

    fn set_memory_capacity(&mut self) -> SdResult {
        let device = self.base.device_mut();
        if is_less_than_csd_version_2(&device.csd()) {
            return device.set_legacy_memory_capacity();
        }
        let capacity = memory_capacity_from_csd(device);
        device.set_memory_capacity(capacity);
        Ok(())
    }

    /// ACMD42 to release the DAT3 pull-up. Cards without it still work.
    fn try_disconnect_dat3_pull_up_resistor(&mut self) {
        match issue_command_app_cmd(&mut self.base, DeviceState::Tran, DeviceStatus::empty()) {
            Ok(()) => {
                if let Err(err) = self.base.issue_command_and_check_r1(
                    cmd::APP_SET_CLR_CARD_DETECT,
                    0,
                    false,
                    DeviceState::Tran,
                    DeviceStatus::empty(),
                ) {
                    warn!("sd: ACMD42 failed: {:?}", err);
                }
            }
            Err(err) => warn!("sd: CMD55 before ACMD42 failed: {:?}", err),
        }
        if let Err(err) = self.base.issue_command_send_status(DeviceStatus::empty()) {
            warn!("sd: status after ACMD42 failed: {:?}", err);
        }
    }

    fn extend_bus_width(&mut self, max_bus_width: BusWidth, sd_bus_widths: u8) -> SdResult {
        if max_bus_width == BusWidth::OneBit
            || !is_supported_bus_width_4bit(sd_bus_widths)
            || !self.base.host().is_supported_bus_width(BusWidth::FourBit)
        {
            return Ok(());
        }
        issue_command_app_cmd(&mut self.base, DeviceState::Tran, DeviceStatus::empty())?;
        self.base
            .issue_command_and_check_r1(cmd::APP_SET_BUS_WIDTH, 0x2, false, DeviceState::Tran, DeviceStatus::empty())?;
        self.base.host_mut().set_bus_width(BusWidth::FourBit);
        Ok(())
    }

    fn extend_bus_speed_at_uhs_i_mode(&mut self, max_speed_mode: SpeedMode) -> SdResult {
        if self.base.host().bus_width() != BusWidth::FourBit {
            return Err(SdError::SdCardNot4BitBusWidthAtUhsIMode);
        }
        let wb = &mut self.work_buffer[..];
        issue_command_check_supported_function(&mut self.base, wb)?;
        let (mode, speed_mode) = if max_speed_mode == SpeedMode::SdSdr104 && is_supported_access_mode(wb, AccessMode::Sdr104) {
            (AccessMode::Sdr104, SpeedMode::SdSdr104)
        } else if (max_speed_mode == SpeedMode::SdSdr104 || max_speed_mode == SpeedMode::SdSdr50)
            && is_supported_access_mode(wb, AccessMode::Sdr50)
        {
            (AccessMode::Sdr50, SpeedMode::SdSdr50)
        } else {
            return Err(SdError::SdCardNotSupportSdr104AndSdr50);
        };
        switch_access_mode(&mut self.base, mode, wb)?;
        let host = self.base.host_mut();
        host.set_speed_mode(speed_mode)?;
        host.tuning(speed_mode, cmd::SEND_TUNING_BLOCK)?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    fn extend_bus_speed_at_non_uhs_i_mode(&mut self, max_speed_mode: SpeedMode, spec_under_1_1: bool) -> SdResult {
        if max_speed_mode == SpeedMode::SdDefaultSpeed || spec_under_1_1 {
            return Ok(());
        }
        let wb = &mut self.work_buffer[..];
        issue_command_check_supported_function(&mut self.base, wb)?;
        if !is_supported_access_mode(wb, AccessMode::HighSpeed) {
            return Ok(());
        }
        switch_access_mode(&mut self.base, AccessMode::HighSpeed, wb)?;
        self.base.issue_command_send_status(DeviceStatus::empty())?;
        self.base.host_mut().set_speed_mode(SpeedMode::SdHighSpeed)
    }

    fn startup_sd_card_device(&mut self, max_bus_width: BusWidth, max_speed_mode: SpeedMode) -> SdResult {
        let host = self.base.host_mut();
        host.startup(BusPower::V3_3, BusWidth::OneBit, SpeedMode::SdIdentification, false)?;
        wait_microseconds(1000);
        wait_clocks(74, host.device_clock_frequency_khz());

        self.base.issue_command_go_idle_state()?;
        let spec_under_2 = match self.issue_command_send_if_cond() {
            Ok(()) => false,
            Err(SdError::ResponseTimeoutError) => true,
            Err(err) => return Err(err),
        };
        self.base.device_mut().set_rca(0);

        let can_use_uhs_i_mode = max_bus_width != BusWidth::OneBit
            && (max_speed_mode == SpeedMode::SdSdr104 || max_speed_mode == SpeedMode::SdSdr50);
        let host = self.base.host();
        let uhs_i_supported = host.is_supported_tuning() && host.is_supported_bus_power(BusPower::V1_8);
        self.change_to_ready_state(spec_under_2, can_use_uhs_i_mode && uhs_i_supported)?;

        let cid = self.base.issue_command_all_send_cid()?;
        self.base.device_mut().set_cid(&cid);
        self.change_to_stby_state_and_get_rca()?;
        let csd = self.base.issue_command_send_csd()?;
        self.base.device_mut().set_csd(&csd);
        self.set_memory_capacity()?;

        if !self.is_uhs_i_mode {
            self.base.host_mut().set_speed_mode(SpeedMode::SdDefaultSpeed)?;
        }
        self.base.issue_command_select_card()?;
        self.base.issue_command_set_block_len_to_sector_size()?;
        self.try_disconnect_dat3_pull_up_resistor();

        get_scr(&mut self.base, &mut self.work_buffer[..])?;
        let sd_bus_widths = sd_bus_widths(&self.work_buffer[..]);
        let spec_under_1_1 = is_less_than_specification_1_1(&self.work_buffer[..]);

        self.extend_bus_width(max_bus_width, sd_bus_widths)?;
        if self.is_uhs_i_mode {
            self.extend_bus_speed_at_uhs_i_mode(max_speed_mode)?;
        } else {
            self.extend_bus_speed_at_non_uhs_i_mode(max_speed_mode, spec_under_1_1)?;
        }
        self.base.host_mut().set_power_saving(true);
        Ok(())
    }

    /// Access mode the card is running in, as it reports it.
    pub fn speed_mode(&mut self) -> SdResult<SpeedMode> {
        self.base.device().check_accessible()?;
        get_scr(&mut self.base, &mut self.work_buffer[..])?;
        if is_less_than_specification_1_1(&self.work_buffer[..]) {
            return Ok(SpeedMode::SdDefaultSpeed);
        }
        issue_command_check_supported_function(&mut self.base, &mut self.work_buffer[..])?;
        current_speed_mode(&self.work_buffer[..], self.is_uhs_i_mode)
    }

    pub fn put_to_sleep(&mut self) {
        if !self.base.device().is_awake() {
            return;
        }
        self.base.device_mut().put_to_sleep();
        if let Some(detector) = self.detector() {
            detector.put_to_sleep();
        }
        let device = self.base.device();
        if device.is_active() && !device.is_removed() {
            self.base.host_mut().put_to_sleep();
        }
    }

    /// Wake the controller and the detector. If the card does not answer
    /// after the wake, the detector re-evaluates insertion unconditionally.
    pub fn awaken(&mut self) {
        if self.base.device().is_awake() {
            return;
        }
        let mut force_detection = false;
        let device = self.base.device();
        if device.is_active() && !device.is_removed() {
            match self.base.host_mut().awaken() {
                Ok(()) => {
                    force_detection = self.base.issue_command_send_status(DeviceStatus::empty()).is_err();
                }
                Err(err) => {
                    error!("sd: awaken failed: {:?}", err);
                    self.base.push_error_log(true, format_args!("A:{:X}", err.code()));
                    force_detection = true;
                }
            }
        }
        if let Some(detector) = self.detector() {
            detector.awaken(force_detection);
        }
        self.base.device_mut().awaken();
    }

    pub fn scr(&mut self, dst: &mut [u8]) -> SdResult {
        self.base.device().check_accessible()?;
        get_scr(&mut self.base, dst)
    }

    pub fn switch_function_status(&mut self, dst: &mut [u8], function: SdCardSwitchFunction) -> SdResult {
        assert!(dst.len() >= SWITCH_FUNCTION_STATUS_SIZE);
        self.base.device().check_accessible()?;
        get_scr(&mut self.base, dst)?;
        if is_less_than_specification_1_1(dst) {
            return Err(SdError::SdCardNotSupportSwitchFunctionStatus);
        }
        let mode = match function {
            SdCardSwitchFunction::CheckSupportedFunction => {
                return issue_command_check_supported_function(&mut self.base, dst);
            }
            SdCardSwitchFunction::CheckDefault => AccessMode::Default,
            SdCardSwitchFunction::CheckHighSpeed => AccessMode::HighSpeed,
            SdCardSwitchFunction::CheckSdr50 => AccessMode::Sdr50,
            SdCardSwitchFunction::CheckSdr104 => AccessMode::Sdr104,
            SdCardSwitchFunction::CheckDdr50 => AccessMode::Ddr50,
        };
        issue_command_switch_access_mode(&mut self.base, dst, false, mode)
    }

    /// Maximum current, in mA, the card would draw in `speed_mode`.
    pub fn current_consumption(&mut self, speed_mode: SpeedMode) -> SdResult<u16> {
        self.base.device().check_accessible()?;
        let wb = &mut self.work_buffer[..];
        get_scr(&mut self.base, wb)?;
        if is_less_than_specification_1_1(wb) {
            return Err(SdError::SdCardNotSupportSwitchFunctionStatus);
        }
        let mode = AccessMode::for_speed_mode(speed_mode);
        issue_command_switch_access_mode(&mut self.base, wb, false, mode)?;
        if !is_supported_access_mode(wb, mode) {
            return Err(SdError::SdCardNotSupportAccessMode);
        }
        Ok(maximum_current_consumption(wb))
    }

    pub fn sd_status(&mut self, dst: &mut [u8]) -> SdResult {
        self.base.device().check_accessible()?;
        get_sd_status(&mut self.base, dst)
    }

    /// Size of the protected area in sectors.
    pub fn protected_area_capacity(&mut self) -> SdResult<u32> {
        self.base.device().check_accessible()?;
        get_sd_status(&mut self.base, &mut self.work_buffer[..])?;
        let size = size_of_protected_area(&self.work_buffer[..]);
        let device = self.base.device();
        if !is_less_than_csd_version_2(&device.csd()) {
            // bytes on high-capacity cards
            return Ok(size / SECTOR_SIZE as u32);
        }
        let (c_size_mult, read_bl_len) = device.legacy_capacity_parameters();
        let shift = u32::from(read_bl_len) + u32::from(c_size_mult) + 2;
        if shift < 9 {
            return Err(SdError::UnexpectedDeviceCsdValue);
        }
        Ok(size << (shift - 9))
    }

    fn log_csd(&mut self) {
        let csd = self.base.device().csd();
        let mut words = [0u32; 4];
        for (word, bytes) in words.iter_mut().zip(csd.chunks(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        self.base.push_error_log(
            false,
            format_args!("{:06X}{:08X}{:08X}{:08X}", words[3] & 0x00FF_FFFF, words[2], words[1], words[0]),
        );
    }
}

impl<H: HostController> DeviceAccessor for SdCardDeviceAccessor<H> {
    type Host = H;

    fn base(&self) -> &BaseDeviceAccessor<H> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseDeviceAccessor<H> {
        &mut self.base
    }

    fn prepare_activation(&mut self) -> SdResult {
        if let Some(detector) = self.detector() {
            self.base.device().clear_removed_event();
            if !detector.is_inserted() {
                return Err(SdError::NoDevice);
            }
        }
        Ok(())
    }

    fn on_activate(&mut self) -> SdResult {
        let mut result = Ok(());
        for (i, &(bus_width, speed_mode)) in STARTUP_PARAMETERS.iter().enumerate() {
            self.max_bus_width = bus_width;
            self.max_speed_mode = speed_mode;
            match self.startup_sd_card_device(bus_width, speed_mode) {
                Ok(()) => {
                    if i != 0 {
                        self.base.push_error_log(
                            true,
                            format_args!("S {} {}:0", bus_width.bits(), speed_mode.log_name()),
                        );
                        self.base.increment_activation_error_corrections();
                    }
                    info!("sd: active, {}-bit {:?}", self.base.host().bus_width().bits(), self.base.host().speed_mode());
                    return Ok(());
                }
                Err(err) => {
                    self.base.device().check_removed()?;
                    debug!("sd: startup {}-bit {:?} failed: {:?}", bus_width.bits(), speed_mode, err);
                    self.base.push_error_log(
                        false,
                        format_args!("S {} {}:{:X}", bus_width.bits(), speed_mode.log_name(), err.code()),
                    );
                    self.base.host_mut().shutdown();
                    result = Err(err);
                }
            }
        }
        if result == Err(SdError::UnexpectedDeviceCsdValue) {
            self.log_csd();
        }
        self.base.push_error_timestamp();
        error!("sd: activation failed: {:?}", result);
        if let Err(err) = result {
            self.check_removed_after_debounce(err)?;
        }
        result
    }

    fn on_read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult {
        let result = self.read_write_multiple(sector_index, num_sectors, 0, buf);
        if let Err(err) = result {
            self.check_removed_after_debounce(err)?;
        }
        result
    }

    fn re_startup(&mut self) -> SdResult {
        self.base.host_mut().shutdown();
        let (bus_width, speed_mode) = (self.max_bus_width, self.max_speed_mode);
        if let Err(err) = self.startup_sd_card_device(bus_width, speed_mode) {
            self.base.device().check_removed()?;
            self.base.push_error_log(
                false,
                format_args!("S {} {}:{:X}", bus_width.bits(), speed_mode.log_name(), err.code()),
            );
            return Err(err);
        }
        Ok(())
    }
}

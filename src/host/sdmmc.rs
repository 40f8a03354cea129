//! Tegra SDMMC controller: the SD host standard engine plus the vendor
//! calibration, tuning, pad and power handling of each physical port.

use super::power::{set_sdmmc1_schmitt_trigger, PowerControlStrategy};
use super::regs::*;
use super::standard::SdHostStandardController;
use super::*;
use crate::clkrst;
use crate::error::SdError;
use crate::hal::*;
use crate::timer::{wait_clocks, wait_microseconds, ManualTimer};

const TUNING_COMMAND_TIMEOUT_MS: u32 = 5;
const DLL_CALIBRATION_START_TIMEOUT_MS: u32 = 5;
const DLL_CALIBRATION_DONE_TIMEOUT_MS: u32 = 10;
const AUTO_CAL_TIMEOUT_MS: u32 = 10;

const APB_MISC_GP_SDMMC1_PAD_CFGPADCTRL: PhysAddr = 0x7000_08D4;
const APB_MISC_GP_SDMMC2_PAD_CFGPADCTRL: PhysAddr = 0x7000_0A9C;
const APB_MISC_GP_SDMMC4_PAD_CFGPADCTRL: PhysAddr = 0x7000_0AB4;
const PAD_CFG_PARK: u32 = 1 << 14;
const PAD_CFG_DRVDN_SHIFT: u32 = 12;
const PAD_CFG_DRVDN_MASK: u32 = 0x7F << 12;
const PAD_CFG_DRVUP_SHIFT: u32 = 20;
const PAD_CFG_DRVUP_MASK: u32 = 0x7F << 20;
const PAD_CFG_SLWR_SHIFT: u32 = 28;
const PAD_CFG_SLWR_MASK: u32 = 0x3 << 28;
const PAD_CFG_SLWF_SHIFT: u32 = 30;
const PAD_CFG_SLWF_MASK: u32 = 0x3 << 30;
const SDMMC1_SLEW_CODE: u32 = 1;

const SDMEMCOMP_VREF_SEL: u32 = 0x7;

/// The physical controller instances this driver runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdmmcPort {
    /// SD card slot.
    Sdmmc1,
    /// Game card ASIC.
    Sdmmc2,
    /// Soldered eMMC.
    Sdmmc4,
}

impl SdmmcPort {
    pub fn register_base(self) -> PhysAddr {
        match self {
            SdmmcPort::Sdmmc1 => 0x700B_0000,
            SdmmcPort::Sdmmc2 => 0x700B_0200,
            SdmmcPort::Sdmmc4 => 0x700B_0600,
        }
    }

    fn clock_reset_module(self) -> clkrst::Module {
        match self {
            SdmmcPort::Sdmmc1 => clkrst::Module::Sdmmc1,
            SdmmcPort::Sdmmc2 => clkrst::Module::Sdmmc2,
            SdmmcPort::Sdmmc4 => clkrst::Module::Sdmmc4,
        }
    }

    fn pad_cfg(self) -> &'static Reg<u32> {
        reg32(match self {
            SdmmcPort::Sdmmc1 => APB_MISC_GP_SDMMC1_PAD_CFGPADCTRL,
            SdmmcPort::Sdmmc2 => APB_MISC_GP_SDMMC2_PAD_CFGPADCTRL,
            SdmmcPort::Sdmmc4 => APB_MISC_GP_SDMMC4_PAD_CFGPADCTRL,
        })
    }

    fn is_supported_bus_power(self, bus_power: BusPower) -> bool {
        match bus_power {
            BusPower::Off => false,
            BusPower::V1_8 => true,
            BusPower::V3_3 => self == SdmmcPort::Sdmmc1,
        }
    }

    fn is_supported_bus_width(self, bus_width: BusWidth) -> bool {
        match (self, bus_width) {
            (_, BusWidth::OneBit) => true,
            (SdmmcPort::Sdmmc1, BusWidth::FourBit) => true,
            (SdmmcPort::Sdmmc1, BusWidth::EightBit) => false,
            (SdmmcPort::Sdmmc2, BusWidth::FourBit) => false,
            (SdmmcPort::Sdmmc2, BusWidth::EightBit) => true,
            (SdmmcPort::Sdmmc4, _) => true,
        }
    }

    fn outbound_tap_value(self) -> u32 {
        match (self, is_soc_mariko()) {
            (SdmmcPort::Sdmmc1, false) => 2,
            (SdmmcPort::Sdmmc1, true) => 0xE,
            (_, false) => 8,
            (_, true) => 0xD,
        }
    }

    fn default_inbound_tap_value(self) -> u8 {
        match (self, is_soc_mariko()) {
            (SdmmcPort::Sdmmc1, false) => 4,
            (SdmmcPort::Sdmmc1, true) => 0xB,
            _ => 0,
        }
    }

    /// Auto-calibration (pull-down, pull-up) offsets.
    fn auto_cal_offsets(self, bus_power: BusPower) -> (u32, u32) {
        match (self, bus_power, is_soc_mariko()) {
            (SdmmcPort::Sdmmc1, BusPower::V1_8, false) => (0x7B, 0x7B),
            (SdmmcPort::Sdmmc1, BusPower::V1_8, true) => (0x6, 0x6),
            (SdmmcPort::Sdmmc1, BusPower::V3_3, false) => (0x7D, 0x00),
            (SdmmcPort::Sdmmc1, BusPower::V3_3, true) => (0x0, 0x0),
            (_, BusPower::V1_8, _) => (0x5, 0x5),
            (port, bp, _) => panic!("{:?} has no calibration offsets for {:?}", port, bp),
        }
    }

    /// Drive codes (down, up) used when auto-calibration gives up.
    fn default_drive_strength(self, bus_power: BusPower) -> (u32, u32) {
        match (self, bus_power) {
            (SdmmcPort::Sdmmc1, BusPower::V3_3) => (0x12, 0x12),
            (SdmmcPort::Sdmmc1, BusPower::V1_8) => (0x11, 0x15),
            (_, BusPower::V1_8) => (0x10, 0x10),
            (port, bp) => panic!("{:?} has no drive strength for {:?}", port, bp),
        }
    }

    fn is_need_periodic_drive_strength_calibration(self) -> bool {
        self != SdmmcPort::Sdmmc1 && !is_soc_mariko()
    }
}

/// Maps a speed mode to the clock source target and the SD clock divider.
fn divider_setting(speed_mode: SpeedMode) -> (u32, u16) {
    use self::SpeedMode::*;
    match speed_mode {
        MmcIdentification => (26_000, 66),
        MmcLegacySpeed => (26_000, 1),
        MmcHighSpeed => (52_000, 1),
        MmcHs200 | MmcHs400 => (200_000, 1),
        SdIdentification => (25_000, 64),
        SdDefaultSpeed | SdSdr12 => (25_000, 1),
        SdHighSpeed | SdSdr25 | SdDdr50 => (50_000, 1),
        SdSdr50 => (100_000, 1),
        SdSdr104 => (200_000, 1),
        GcAsicFpgaSpeed => (40_800, 1),
        GcAsicSpeed => (200_000, 2),
    }
}

/// Controller configuration saved across sleep.
#[derive(Debug, Clone, Copy)]
struct SleepState {
    bus_power: BusPower,
    bus_width: BusWidth,
    speed_mode: SpeedMode,
    tap_value: u8,
    is_power_saving_enable: bool,
}

pub struct SdmmcController {
    port: SdmmcPort,
    vendor: RegBlock<'static, SdmmcRegs>,
    standard: SdHostStandardController,
    /// Only the SD card slot switches its own rail.
    power: Option<PowerControlStrategy>,
    is_shutdown: bool,
    is_awake: bool,
    current_speed_mode: Option<SpeedMode>,
    before_sleep: Option<SleepState>,
    tap_value_for_hs400: Option<u8>,
    drive_strength_calibration_status: SdResult,
}

impl SdmmcController {
    pub fn new(port: SdmmcPort, power: Option<PowerControlStrategy>) -> Self {
        Self::with_registers(port, RegBlock::from_raw(port.register_base()), power)
    }

    pub(crate) fn with_registers(
        port: SdmmcPort,
        vendor: RegBlock<'static, SdmmcRegs>,
        power: Option<PowerControlStrategy>,
    ) -> Self {
        // the standard block sits at the start of the vendor block
        let standard = SdHostStandardController::new(unsafe { RegBlock::from_virt(vendor.addr()) });
        Self {
            port,
            vendor,
            standard,
            power,
            is_shutdown: true,
            is_awake: true,
            current_speed_mode: None,
            before_sleep: None,
            tap_value_for_hs400: None,
            drive_strength_calibration_status: Err(SdError::DriveStrengthCalibrationNotCompleted),
        }
    }

    pub fn port(&self) -> SdmmcPort {
        self.port
    }

    pub fn set_interrupt_event(&mut self, event: Option<Arc<dyn Event>>) {
        self.standard.set_interrupt_event(event);
    }

    fn std_regs(&self) -> &SdHostRegs {
        &self.vendor.sd_host_standard
    }

    fn release_reset(&mut self, speed_mode: SpeedMode) {
        let module = self.port.clock_reset_module();
        if clkrst::is_available(module) {
            self.standard.disable_device_clock();
            self.standard.ensure_control();
        }
        let (target_khz, _) = divider_setting(speed_mode);
        clkrst::release_reset(module, target_khz);
    }

    fn assert_reset(&self) {
        clkrst::assert_reset(self.port.clock_reset_module());
    }

    fn power_on(&mut self, bus_power: BusPower) -> SdResult {
        match self.power.as_mut() {
            Some(power) => power.power_on(bus_power),
            None => {
                assert_eq!(bus_power, BusPower::V1_8, "{:?} rail is fixed at 1.8V", self.port);
                Ok(())
            }
        }
    }

    fn power_off(&mut self) {
        if let Some(power) = self.power.as_mut() {
            power.power_off();
        }
    }

    fn lower_bus_power(&mut self) -> SdResult {
        match self.power.as_mut() {
            Some(power) => power.lower_bus_power(),
            None => panic!("{:?} cannot change its bus power", self.port),
        }
    }

    fn set_schmitt_trigger(&self, bus_power: BusPower) {
        if self.port != SdmmcPort::Sdmmc1 {
            return;
        }
        let enable = is_soc_mariko() || bus_power == BusPower::V1_8;
        set_sdmmc1_schmitt_trigger(enable);
    }

    fn set_slew_codes(&self) {
        if self.port != SdmmcPort::Sdmmc1 || is_soc_mariko() {
            return;
        }
        let pad = self.port.pad_cfg();
        pad.write_field(
            PAD_CFG_SLWR_MASK | PAD_CFG_SLWF_MASK,
            (SDMMC1_SLEW_CODE << PAD_CFG_SLWR_SHIFT) | (SDMMC1_SLEW_CODE << PAD_CFG_SLWF_SHIFT),
        );
        pad.read();
    }

    fn clear_pad_parked(&self) {
        if self.port != SdmmcPort::Sdmmc1 {
            self.port.pad_cfg().clear_bits(PAD_CFG_PARK);
        }
    }

    fn set_drive_strength_to_default_values(&self, bus_power: BusPower) {
        let (drvdn, drvup) = self.port.default_drive_strength(bus_power);
        self.port.pad_cfg().write_field(
            PAD_CFG_DRVDN_MASK | PAD_CFG_DRVUP_MASK,
            (drvdn << PAD_CFG_DRVDN_SHIFT) | (drvup << PAD_CFG_DRVUP_SHIFT),
        );
    }

    fn set_drive_code_offsets(&self, bus_power: BusPower) {
        let (pd, pu) = self.port.auto_cal_offsets(bus_power);
        self.vendor.auto_cal_config.write_field(
            AUTO_CAL_CONFIG_PD_OFFSET_MASK | AUTO_CAL_CONFIG_PU_OFFSET_MASK,
            (pd << AUTO_CAL_CONFIG_PD_OFFSET_SHIFT) | pu,
        );
        wait_microseconds(1000);
    }

    /// Run pad auto-calibration with the SD clock stopped.
    fn calibrate_drive_strength(&mut self, bus_power: BusPower) {
        self.drive_strength_calibration_status = Err(SdError::DriveStrengthCalibrationNotCompleted);

        let clock_enabled = self.standard.is_sd_clock_enabled();
        if clock_enabled {
            self.standard.set_sd_clock(false);
        }

        let pad = &self.vendor.sdmemcomppadctrl;
        if !pad.any_bits(SDMEMCOMPPADCTRL_PAD_E_INPUT_OR_E_PWRD) {
            pad.set_bits(SDMEMCOMPPADCTRL_PAD_E_INPUT_OR_E_PWRD);
            self.standard.ensure_control();
            wait_microseconds(1);
        }

        self.vendor
            .auto_cal_config
            .set_bits(AUTO_CAL_CONFIG_START | AUTO_CAL_CONFIG_ENABLE);
        self.standard.ensure_control();
        wait_microseconds(2);

        let mut timer = ManualTimer::new(AUTO_CAL_TIMEOUT_MS);
        loop {
            let status = self.vendor.auto_cal_status.read();
            if status & AUTO_CAL_STATUS_ACTIVE == 0 {
                let pullup = status & AUTO_CAL_STATUS_PULLUP_MASK;
                if pullup == 0x1F {
                    self.drive_strength_calibration_status = Err(SdError::SdmmcCompShortToGnd);
                }
                if pullup == 0 {
                    self.drive_strength_calibration_status = Err(SdError::SdmmcCompOpen);
                }
                break;
            }
            if !timer.update() {
                self.drive_strength_calibration_status =
                    Err(SdError::DriveStrengthCalibrationSoftwareTimeout);
                self.set_drive_strength_to_default_values(bus_power);
                self.vendor.auto_cal_config.clear_bits(AUTO_CAL_CONFIG_ENABLE);
                break;
            }
        }

        self.vendor
            .sdmemcomppadctrl
            .clear_bits(SDMEMCOMPPADCTRL_PAD_E_INPUT_OR_E_PWRD);

        if clock_enabled {
            self.standard.set_sd_clock(true);
        }

        match self.drive_strength_calibration_status {
            Err(SdError::DriveStrengthCalibrationNotCompleted) => {
                self.drive_strength_calibration_status = Ok(())
            }
            Err(err) => debug!("{:?}: drive strength calibration: {:?}", self.port, err),
            Ok(()) => {}
        }
    }

    fn startup_core(&mut self, bus_power: BusPower) -> SdResult {
        self.set_schmitt_trigger(bus_power);

        // one-cycle delay version of cmd_oen
        self.vendor.io_spare.set_bits(IO_SPARE_SPARE_OUT_3);
        self.vendor
            .vendor_io_trim_cntrl
            .clear_bits(IO_TRIM_CNTRL_SEL_VREG);

        self.vendor.vendor_clock_cntrl.write_field(
            VENDOR_CLOCK_TRIM_VAL_MASK,
            self.port.outbound_tap_value() << VENDOR_CLOCK_TRIM_VAL_SHIFT,
        );
        self.vendor
            .vendor_clock_cntrl
            .clear_bits(VENDOR_CLOCK_SPI_MODE_CLKEN_OVERRIDE);

        self.set_slew_codes();
        self.vendor
            .sdmemcomppadctrl
            .write_field(SDMEMCOMPPADCTRL_VREF_SEL_MASK, SDMEMCOMP_VREF_SEL);

        self.set_drive_code_offsets(bus_power);
        self.calibrate_drive_strength(bus_power);

        self.standard.enable_internal_clock()
    }

    fn set_clock_trimmer(&mut self, speed_mode: SpeedMode, tap_value: u8) -> SdResult {
        if speed_mode == SpeedMode::MmcHs400 {
            self.vendor.vendor_cap_overrides.write_field(
                VENDOR_CAP_OVERRIDES_DQS_TRIM_MASK,
                VENDOR_CAP_OVERRIDES_DQS_TRIM_HS400 << VENDOR_CAP_OVERRIDES_DQS_TRIM_SHIFT,
            );
        }
        self.vendor
            .vendor_tuning_cntrl0
            .clear_bits(TUNING_CNTRL0_TAP_VALUE_UPDATED_BY_HW);
        self.vendor.vendor_clock_cntrl.write_field(
            VENDOR_CLOCK_TAP_VAL_MASK,
            u32::from(tap_value) << VENDOR_CLOCK_TAP_VAL_SHIFT,
        );
        self.standard.reset_cmd_dat_line()
    }

    fn current_tap_value(&self) -> u8 {
        ((self.vendor.vendor_clock_cntrl.read() & VENDOR_CLOCK_TAP_VAL_MASK) >> VENDOR_CLOCK_TAP_VAL_SHIFT) as u8
    }

    fn calibrate_dll(&mut self) -> SdResult {
        let clock_disabled = !self.standard.is_sd_clock_enabled();
        if clock_disabled {
            self.standard.set_sd_clock(true);
        }
        let res = self.run_dll_calibration();
        if clock_disabled {
            self.standard.set_sd_clock(false);
        }
        res
    }

    fn run_dll_calibration(&self) -> SdResult {
        self.vendor.vendor_dllcal_cfg.set_bits(DLLCAL_CFG_CALIBRATE);

        let mut timer = ManualTimer::new(DLL_CALIBRATION_START_TIMEOUT_MS);
        while self.vendor.vendor_dllcal_cfg.any_bits(DLLCAL_CFG_CALIBRATE) {
            if !timer.update() {
                return Err(SdError::SdmmcDllCalibrationSoftwareTimeout);
            }
        }

        let mut timer = ManualTimer::new(DLL_CALIBRATION_DONE_TIMEOUT_MS);
        while self.vendor.vendor_dllcal_cfg_sta.read() & DLLCAL_CFG_STA_DLL_CAL_ACTIVE != 0 {
            if !timer.update() {
                return Err(SdError::SdmmcDllApplicationSoftwareTimeout);
            }
        }
        Ok(())
    }

    fn set_uhs_mode(&self, mode: u16) {
        let hc2 = &self.std_regs().host_control2;
        hc2.write_field(HostControl2::UHS_MODE_MASK.bits(), mode);
        hc2.set_bits(HostControl2::SIGNALING_1_8V.bits());
    }

    fn set_speed_mode_with_tap_value(&mut self, speed_mode: SpeedMode, tap_value: u8) -> SdResult {
        let clock_enabled = self.standard.is_sd_clock_enabled();
        if clock_enabled {
            self.standard.set_sd_clock(false);
        }

        // the clock stays off if trimming fails
        self.set_clock_trimmer(speed_mode, tap_value)?;

        use self::SpeedMode::*;
        let regs = self.std_regs();
        match speed_mode {
            MmcIdentification | SdIdentification | MmcLegacySpeed | SdDefaultSpeed => {
                regs.host_control.clear_bits(HostControl::HIGH_SPEED.bits());
                regs.host_control2
                    .clear_bits(HostControl2::SIGNALING_1_8V.bits());
            }
            MmcHighSpeed | SdHighSpeed => {
                regs.host_control.set_bits(HostControl::HIGH_SPEED.bits());
                regs.host_control2
                    .clear_bits(HostControl2::SIGNALING_1_8V.bits());
            }
            MmcHs200 => self.set_uhs_mode(uhs_mode::HS200),
            MmcHs400 => self.set_uhs_mode(uhs_mode::HS400),
            SdSdr12 => self.set_uhs_mode(uhs_mode::SDR12),
            SdSdr25 => self.set_uhs_mode(uhs_mode::SDR25),
            SdDdr50 => self.set_uhs_mode(uhs_mode::DDR50),
            SdSdr50 | SdSdr104 | GcAsicFpgaSpeed | GcAsicSpeed => self.set_uhs_mode(uhs_mode::SDR104),
        }
        self.standard.ensure_control();

        let (target_khz, x) = divider_setting(speed_mode);
        let actual_khz = clkrst::set_clock_frequency_khz(self.port.clock_reset_module(), target_khz);
        let x32 = u32::from(x);
        self.standard
            .set_device_clock_frequency_khz((actual_khz + x32 - 1) / x32);

        assert!(x == 1 || x % 2 == 0, "odd SD clock divider {}", x);
        let n = x / 2;
        self.std_regs().clock_control.write_field(
            CLOCK_FREQ_SELECT_MASK | CLOCK_UPPER_FREQ_SELECT_MASK,
            ((n & 0xFF) << CLOCK_FREQ_SELECT_SHIFT) | ((n >> 8) << CLOCK_UPPER_FREQ_SELECT_SHIFT),
        );

        if clock_enabled {
            self.standard.set_sd_clock(true);
        }

        if speed_mode == SpeedMode::MmcHs400 {
            self.calibrate_dll()?;
        }

        self.current_speed_mode = Some(speed_mode);
        Ok(())
    }

    fn issue_tuning_command(&mut self, command_index: u32) -> SdResult {
        assert!(!self.standard.is_power_saving_enable());

        self.standard.wait_while_command_inhibit(true)?;
        self.standard.set_transfer_for_tuning();

        let brr = NormalInt::BUFFER_READ_READY.bits();
        if self.standard.is_interrupt_driven() {
            self.standard.clear_interrupt();
            self.std_regs().normal_signal_enable.set_bits(brr);
        }
        self.std_regs().normal_int_enable.set_bits(brr);
        self.std_regs().normal_int_status.read();

        // issued with the clock stopped
        self.standard.set_sd_clock(false);
        self.standard.set_command_for_tuning(command_index);
        self.standard.ensure_control();
        wait_microseconds(1);
        if let Err(err) = self.standard.abort_transaction() {
            debug!("{:?}: tuning line reset: {:?}", self.port, err);
        }
        self.standard.set_sd_clock(true);

        let res = self.wait_tuning_block();

        if self.standard.is_interrupt_driven() {
            self.std_regs().normal_signal_enable.clear_bits(brr);
        }
        self.std_regs().normal_int_enable.clear_bits(brr);
        self.standard.ensure_control();
        wait_clocks(8, self.standard.device_clock_frequency_khz());
        res
    }

    fn wait_tuning_block(&mut self) -> SdResult {
        let brr = NormalInt::BUFFER_READ_READY.bits();
        if self.standard.is_interrupt_driven() {
            return match self.standard.wait_interrupt(TUNING_COMMAND_TIMEOUT_MS) {
                Ok(()) => {
                    self.std_regs().normal_int_status.write(brr);
                    self.standard.clear_interrupt();
                    Ok(())
                }
                Err(SdError::WaitInterruptSoftwareTimeout) => {
                    let _ = self.standard.abort_transaction();
                    Err(SdError::IssueTuningCommandSoftwareTimeout)
                }
                Err(err) => Err(err),
            };
        }

        self.standard.ensure_control();
        let mut timer = ManualTimer::new(TUNING_COMMAND_TIMEOUT_MS);
        loop {
            if self.std_regs().normal_int_status.has_bits(brr) {
                self.std_regs().normal_int_status.write(brr);
                return Ok(());
            }
            if !timer.update() {
                let _ = self.standard.abort_transaction();
                return Err(SdError::IssueTuningCommandSoftwareTimeout);
            }
        }
    }

    fn calibrate_if_needed(&mut self, needed: bool) {
        if needed && self.port.is_need_periodic_drive_strength_calibration() {
            let bus_power = self.standard.bus_power();
            self.calibrate_drive_strength(bus_power);
        }
    }
}

impl HostController for SdmmcController {
    fn initialize(&mut self) {
        clkrst::initialize(self.port.clock_reset_module());
        info!("{:?}: initialized", self.port);
    }

    fn finalize(&mut self) {
        self.shutdown();
        clkrst::finalize(self.port.clock_reset_module());
    }

    fn set_removed_event(&mut self, event: Option<Arc<dyn Event>>) {
        self.standard.set_removed_event(event);
    }

    fn startup(
        &mut self,
        bus_power: BusPower,
        bus_width: BusWidth,
        speed_mode: SpeedMode,
        power_saving_enable: bool,
    ) -> SdResult {
        assert!(self.is_awake, "{:?} started while asleep", self.port);
        debug!(
            "{:?}: startup {:?} {}bit {}",
            self.port,
            bus_power,
            bus_width.bits(),
            speed_mode.log_name()
        );

        self.release_reset(speed_mode);
        self.is_shutdown = false;

        self.power_on(bus_power)?;
        self.startup_core(bus_power)?;

        self.standard.set_bus_width(bus_width);
        self.standard.set_bus_power(bus_power);
        self.set_speed_mode(speed_mode)?;
        self.set_power_saving(power_saving_enable);
        self.enable_device_clock();
        self.standard.ensure_control();
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.is_shutdown {
            return;
        }
        if self.is_awake {
            self.standard.disable_device_clock();
            self.standard.set_bus_power(BusPower::Off);
            self.standard.ensure_control();
        }
        self.power_off();
        if self.is_awake {
            self.assert_reset();
        }
        self.is_shutdown = true;
        debug!("{:?}: shut down", self.port);
    }

    fn put_to_sleep(&mut self) {
        if self.is_shutdown || !self.is_awake {
            return;
        }
        let speed_mode = self.speed_mode();
        self.before_sleep = Some(SleepState {
            bus_power: self.standard.bus_power(),
            bus_width: self.standard.bus_width(),
            speed_mode,
            tap_value: self.current_tap_value(),
            is_power_saving_enable: self.standard.is_power_saving_enable(),
        });

        self.standard.disable_device_clock();
        self.standard.set_bus_power(BusPower::Off);
        self.standard.ensure_control();
        self.assert_reset();
        self.is_awake = false;
    }

    fn awaken(&mut self) -> SdResult {
        if self.is_shutdown || self.is_awake {
            return Ok(());
        }
        self.is_awake = true;

        let saved = match self.before_sleep {
            Some(saved) => saved,
            None => panic!("{:?} woke without saved state", self.port),
        };

        self.clear_pad_parked();
        self.release_reset(saved.speed_mode);
        self.startup_core(saved.bus_power)?;

        self.standard.set_bus_width(saved.bus_width);
        self.standard.set_bus_power(saved.bus_power);
        self.set_speed_mode_with_tap_value(saved.speed_mode, saved.tap_value)?;
        self.set_power_saving(saved.is_power_saving_enable);
        self.enable_device_clock();
        self.standard.ensure_control();
        Ok(())
    }

    fn switch_to_sdr12(&mut self) -> SdResult {
        self.standard.set_sd_clock(false);

        let dat_lines = PresentState::DAT_LINES.bits();
        if self.std_regs().present_state.read() & dat_lines != 0 {
            return Err(SdError::SdCardNotReadyToVoltageSwitch);
        }

        self.set_speed_mode(SpeedMode::SdSdr12)?;
        self.standard.ensure_control();
        self.lower_bus_power()?;
        self.set_schmitt_trigger(BusPower::V1_8);

        self.set_drive_code_offsets(BusPower::V1_8);
        self.calibrate_drive_strength(BusPower::V1_8);
        self.standard.set_bus_power(BusPower::V1_8);

        self.standard.ensure_control();
        wait_microseconds(5000);
        if !self
            .std_regs()
            .host_control2
            .has_bits(HostControl2::SIGNALING_1_8V.bits())
        {
            return Err(SdError::SdHostStandardFailSwitchTo1_8V);
        }

        self.standard.set_sd_clock(true);
        self.standard.ensure_control();
        wait_microseconds(1000);
        if self.std_regs().present_state.read() & dat_lines != dat_lines {
            return Err(SdError::SdCardNotCompleteVoltageSwitch);
        }
        Ok(())
    }

    fn is_supported_bus_power(&self, bus_power: BusPower) -> bool {
        self.port.is_supported_bus_power(bus_power)
    }

    fn bus_power(&self) -> BusPower {
        self.standard.bus_power()
    }

    fn is_supported_bus_width(&self, bus_width: BusWidth) -> bool {
        self.port.is_supported_bus_width(bus_width)
    }

    fn set_bus_width(&mut self, bus_width: BusWidth) {
        self.standard.set_bus_width(bus_width);
    }

    fn bus_width(&self) -> BusWidth {
        self.standard.bus_width()
    }

    fn set_speed_mode(&mut self, speed_mode: SpeedMode) -> SdResult {
        let tap_value = if speed_mode == SpeedMode::MmcHs400 {
            match self.tap_value_for_hs400 {
                Some(tap) => tap,
                None => panic!("HS400 without a saved tuning tap"),
            }
        } else {
            self.port.default_inbound_tap_value()
        };
        self.set_speed_mode_with_tap_value(speed_mode, tap_value)
    }

    fn speed_mode(&self) -> SpeedMode {
        match self.current_speed_mode {
            Some(mode) => mode,
            None => panic!("{:?} speed mode read before startup", self.port),
        }
    }

    fn device_clock_frequency_khz(&self) -> u32 {
        self.standard.device_clock_frequency_khz()
    }

    fn set_power_saving(&mut self, enable: bool) {
        let needed = !enable && self.standard.is_device_clock_enable();
        self.calibrate_if_needed(needed);
        self.standard.set_power_saving(enable);
    }

    fn is_power_saving_enable(&self) -> bool {
        self.standard.is_power_saving_enable()
    }

    fn enable_device_clock(&mut self) {
        let needed = !self.standard.is_power_saving_enable();
        self.calibrate_if_needed(needed);
        self.standard.enable_device_clock();
    }

    fn disable_device_clock(&mut self) {
        self.standard.disable_device_clock();
    }

    fn change_check_transfer_interval(&mut self, ms: u32) {
        self.standard.change_check_transfer_interval(ms);
    }

    fn set_default_check_transfer_interval(&mut self) {
        self.standard.set_default_check_transfer_interval();
    }

    fn max_transfer_num_blocks(&self) -> u32 {
        self.standard.max_transfer_num_blocks()
    }

    fn issue_command(&mut self, command: &Command, xfer: Option<&mut TransferData<'_>>) -> SdResult<u32> {
        let needed = self.standard.is_power_saving_enable();
        self.calibrate_if_needed(needed);
        self.standard.issue_command(command, xfer)
    }

    fn issue_stop_transmission_command(&mut self) -> SdResult<u32> {
        let needed = self.standard.is_power_saving_enable();
        self.calibrate_if_needed(needed);
        self.standard.issue_stop_transmission_command()
    }

    fn last_response(&self, response_type: ResponseType) -> [u32; 4] {
        self.standard.last_response(response_type)
    }

    fn last_stop_transmission_response(&self) -> u32 {
        self.standard.last_stop_transmission_response()
    }

    fn is_supported_tuning(&self) -> bool {
        true
    }

    fn tuning(&mut self, speed_mode: SpeedMode, command_index: u32) -> SdResult {
        self.vendor.vendor_tuning_cntrl1.write(0);

        let (num_tries, iterations) = match speed_mode {
            SpeedMode::MmcHs200 | SpeedMode::MmcHs400 | SpeedMode::SdSdr104 => {
                (128, TUNING_ITERATIONS_TRIES_128)
            }
            SpeedMode::SdSdr50 | SpeedMode::GcAsicFpgaSpeed | SpeedMode::GcAsicSpeed => {
                (256, TUNING_ITERATIONS_TRIES_256)
            }
            other => panic!("no tuning for {:?}", other),
        };
        let cntrl0 = &self.vendor.vendor_tuning_cntrl0;
        cntrl0.write_field(
            TUNING_CNTRL0_NUM_TUNING_ITERATIONS_MASK,
            iterations << TUNING_CNTRL0_NUM_TUNING_ITERATIONS_SHIFT,
        );
        cntrl0.write_field(TUNING_CNTRL0_MUL_M_MASK, 1 << TUNING_CNTRL0_MUL_M_SHIFT);
        cntrl0.set_bits(TUNING_CNTRL0_TAP_VALUE_UPDATED_BY_HW);

        let hc2 = &self.vendor.sd_host_standard.host_control2;
        hc2.set_bits(HostControl2::EXECUTE_TUNING.bits());

        for _ in 0..num_tries {
            self.standard.check_removed()?;
            // a missed tuning block is expected while the window is searched
            let _ = self.issue_tuning_command(command_index);
            if !self
                .std_regs()
                .host_control2
                .any_bits(HostControl2::EXECUTE_TUNING.bits())
            {
                break;
            }
        }

        if !self
            .std_regs()
            .host_control2
            .has_bits(HostControl2::SAMPLING_CLOCK_TUNED.bits())
        {
            debug!("{:?}: tuning for {} failed", self.port, speed_mode.log_name());
            return Err(SdError::TuningFailed);
        }
        Ok(())
    }

    fn save_tuning_status_for_hs400(&mut self) {
        self.tap_value_for_hs400 = Some(self.current_tap_value());
    }

    fn internal_status(&self) -> SdResult {
        self.drive_strength_calibration_status
    }
}

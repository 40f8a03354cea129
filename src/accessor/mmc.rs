//! eMMC identification, bus negotiation, partitions and erase.

use super::*;
use crate::device::DeviceType;
use crate::timer::{wait_clocks, wait_microseconds, ManualTimer};
use aligned::{Aligned, A8};

pub const EXT_CSD_SIZE: usize = 512;

const OCR_CARD_POWER_UP_STATUS: u32 = 1 << 31;
const OCR_ACCESS_MODE_MASK: u32 = 3 << 29;
const OCR_ACCESS_MODE_SECTOR_MODE: u32 = 2 << 29;

const MANUFACTURER_ID_TOSHIBA: u8 = 0x11;

const EXT_CSD_BKOPS_EN: usize = 163;
const EXT_CSD_HS_TIMING: usize = 185;
const EXT_CSD_DEVICE_TYPE: usize = 196;
const EXT_CSD_SEC_COUNT: usize = 212;
const EXT_CSD_BOOT_SIZE_MULT: usize = 226;

const DEVICE_TYPE_HIGH_SPEED_52MHZ: u8 = 1 << 1;
const DEVICE_TYPE_HS200_1_8V: u8 = 1 << 4;
const DEVICE_TYPE_HS400_1_8V: u8 = 1 << 6;

/// Boot partitions are sized in units of 128 KiB.
const BOOT_SIZE_UNIT_SECTORS: u32 = 128 * 1024 / SECTOR_SIZE as u32;

/// Writes must start on a 16 KiB boundary.
const WRITE_SECTOR_ALIGNMENT: u32 = 16 * 1024 / SECTOR_SIZE as u32;

const READY_TIMEOUT_MS: u32 = 1500;
const ERASE_TIMEOUT_MS: u32 = 30000;

#[cfg(feature = "mmc-hs400")]
const FIRST_SPEED_MODE: SpeedMode = SpeedMode::MmcHs400;
#[cfg(not(feature = "mmc-hs400"))]
const FIRST_SPEED_MODE: SpeedMode = SpeedMode::MmcHighSpeed;

/// (max bus width, max speed mode) per activation attempt, fastest first.
const STARTUP_PARAMETERS: [(BusWidth, SpeedMode); 3] = [
    (BusWidth::EightBit, FIRST_SPEED_MODE),
    (BusWidth::EightBit, SpeedMode::MmcHighSpeed),
    (BusWidth::OneBit, SpeedMode::MmcHighSpeed),
];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MmcPartition {
    UserData,
    BootPartition1,
    BootPartition2,
}

/// CMD6 operations on the extended CSD.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum CommandSwitch {
    SetBitsProductionStateAwarenessEnable,
    ClearBitsAutoModeEnable,
    WriteProductionStateAwarenessNormal,
    WriteProductionStateAwarenessPreSolderingWrites,
    WriteProductionStateAwarenessPreSolderingPostWrites,
    SetBitsBkopsEnAutoEn,
    WriteBusWidth4Bit,
    WriteBusWidth8Bit,
    WriteBusWidth8BitDdr,
    WriteHsTimingHighSpeed,
    WriteHsTimingHs200,
    WriteHsTimingHs400,
    WritePartitionAccess(MmcPartition),
}

impl CommandSwitch {
    fn argument(self) -> u32 {
        use self::CommandSwitch::*;
        const SET_BITS: u32 = 1;
        const CLEAR_BITS: u32 = 2;
        const WRITE_BYTE: u32 = 3;
        let (access, index, value) = match self {
            SetBitsProductionStateAwarenessEnable => (SET_BITS, 17, 0x01),
            ClearBitsAutoModeEnable => (CLEAR_BITS, 17, 0x02),
            WriteProductionStateAwarenessNormal => (WRITE_BYTE, 133, 0),
            WriteProductionStateAwarenessPreSolderingWrites => (WRITE_BYTE, 133, 1),
            WriteProductionStateAwarenessPreSolderingPostWrites => (WRITE_BYTE, 133, 2),
            SetBitsBkopsEnAutoEn => (SET_BITS, EXT_CSD_BKOPS_EN as u32, 0x02),
            WriteBusWidth4Bit => (WRITE_BYTE, 183, 1),
            WriteBusWidth8Bit => (WRITE_BYTE, 183, 2),
            WriteBusWidth8BitDdr => (WRITE_BYTE, 183, 6),
            WriteHsTimingHighSpeed => (WRITE_BYTE, EXT_CSD_HS_TIMING as u32, 1),
            WriteHsTimingHs200 => (WRITE_BYTE, EXT_CSD_HS_TIMING as u32, 2),
            WriteHsTimingHs400 => (WRITE_BYTE, EXT_CSD_HS_TIMING as u32, 3),
            WritePartitionAccess(part) => {
                let value = match part {
                    MmcPartition::UserData => 0,
                    MmcPartition::BootPartition1 => 1,
                    MmcPartition::BootPartition2 => 2,
                };
                (WRITE_BYTE, 179, value)
            }
        };
        (access << 24) | (index << 16) | (value << 8)
    }
}

fn is_toshiba_mmc(cid: &[u8]) -> bool {
    cid[14] == MANUFACTURER_ID_TOSHIBA
}

fn is_less_than_specification_4(csd: &[u8]) -> bool {
    let spec_vers = (csd[14] >> 2) & 0xF;
    spec_vers < 4
}

fn is_bkops_auto_enable(ext_csd: &[u8]) -> bool {
    ext_csd[EXT_CSD_BKOPS_EN] & (1 << 1) != 0
}

fn memory_capacity_from_ext_csd(ext_csd: &[u8]) -> u32 {
    let mut sec_count = [0u8; 4];
    sec_count.copy_from_slice(&ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4]);
    u32::from_le_bytes(sec_count)
}

fn boot_partition_capacity_from_ext_csd(ext_csd: &[u8]) -> u32 {
    u32::from(ext_csd[EXT_CSD_BOOT_SIZE_MULT]) * BOOT_SIZE_UNIT_SECTORS
}

fn speed_mode_from_ext_csd(ext_csd: &[u8]) -> SdResult<SpeedMode> {
    match ext_csd[EXT_CSD_HS_TIMING] & 0xF {
        0 => Ok(SpeedMode::MmcLegacySpeed),
        1 => Ok(SpeedMode::MmcHighSpeed),
        2 => Ok(SpeedMode::MmcHs200),
        3 => Ok(SpeedMode::MmcHs400),
        _ => Err(SdError::UnexpectedMmcExtendedCsdValue),
    }
}

pub struct MmcDeviceAccessor<H> {
    base: BaseDeviceAccessor<H>,
    work_buffer: Aligned<A8, [u8; EXT_CSD_SIZE]>,
    max_bus_width: BusWidth,
    max_speed_mode: SpeedMode,
    /// `None` while a partition switch is in flight or after it failed.
    current_partition: Option<MmcPartition>,
    is_initialized: bool,
}

impl<H: HostController> MmcDeviceAccessor<H> {
    pub fn new(host: H) -> Self {
        Self {
            base: BaseDeviceAccessor::new(host, Device::new(DeviceType::Mmc)),
            work_buffer: Aligned([0u8; EXT_CSD_SIZE]),
            max_bus_width: BusWidth::EightBit,
            max_speed_mode: FIRST_SPEED_MODE,
            current_partition: Some(MmcPartition::UserData),
            is_initialized: false,
        }
    }

    pub fn initialize(&mut self) {
        if self.is_initialized {
            return;
        }
        self.base.host_mut().initialize();
        self.is_initialized = true;
        info!("mmc: initialized");
    }

    pub fn finalize(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_initialized = false;
        self.deactivate();
        self.base.host_mut().finalize();
    }

    fn issue_command_send_op_cond(&mut self, bus_power: BusPower) -> SdResult<u32> {
        let voltage = match bus_power {
            BusPower::V1_8 => 0x00_0080,
            BusPower::V3_3 => 0x03_F800,
            BusPower::Off => panic!("CMD1 needs a powered bus"),
        };
        let argument = OCR_ACCESS_MODE_SECTOR_MODE | voltage;
        let command = Command::new(cmd::SEND_OP_COND, argument, ResponseType::R3, false);
        let host = self.base.host_mut();
        host.issue_command(&command, None)?;
        Ok(host.last_response(ResponseType::R3)[0])
    }

    fn issue_command_set_relative_addr(&mut self) -> SdResult {
        let rca = u32::from(self.base.device().rca());
        assert!(rca > 0);
        self.base
            .issue_command_and_check_r1(cmd::SET_RELATIVE_ADDR, rca << 16, false, DeviceState::Unknown, DeviceStatus::empty())
            .map(|_| ())
    }

    fn issue_command_switch(&mut self, cs: CommandSwitch) -> SdResult {
        self.base
            .issue_command_and_check_r1(cmd::SWITCH, cs.argument(), true, DeviceState::Unknown, DeviceStatus::empty())
            .map(|_| ())
    }

    fn switch_and_check(&mut self, cs: CommandSwitch) -> SdResult {
        self.issue_command_switch(cs)?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    /// CMD8 into the work buffer.
    fn issue_command_send_ext_csd(&mut self) -> SdResult {
        let command = Command::new(cmd::SEND_EXT_CSD, 0, ResponseType::R1, false);
        let mut xfer = TransferData::read(&mut self.work_buffer[..], EXT_CSD_SIZE as u32, 1);
        self.base.host_mut().issue_command(&command, Some(&mut xfer))?;
        let status = self.base.host().last_response(ResponseType::R1)[0];
        self.base.device().check_device_status(status)
    }

    fn erase_argument(&self, sector_index: u32) -> u32 {
        if self.base.device().is_high_capacity() {
            sector_index
        } else {
            sector_index * SECTOR_SIZE as u32
        }
    }

    fn issue_command_erase_group_start(&mut self, sector_index: u32) -> SdResult {
        let argument = self.erase_argument(sector_index);
        self.base
            .issue_command_and_check_r1(cmd::ERASE_GROUP_START, argument, false, DeviceState::Unknown, DeviceStatus::empty())
            .map(|_| ())
    }

    fn issue_command_erase_group_end(&mut self, sector_index: u32) -> SdResult {
        let argument = self.erase_argument(sector_index);
        self.base
            .issue_command_and_check_r1(cmd::ERASE_GROUP_END, argument, false, DeviceState::Tran, DeviceStatus::empty())
            .map(|_| ())
    }

    fn issue_command_erase(&mut self) -> SdResult {
        self.base
            .issue_command_and_check_r1(cmd::ERASE, 0, false, DeviceState::Tran, DeviceStatus::empty())
            .map(|_| ())
    }

    /// Put Toshiba parts back in normal production-state mode after an
    /// erase of the user area.
    fn cancel_toshiba_mmc_model(&mut self) -> SdResult {
        self.switch_and_check(CommandSwitch::SetBitsProductionStateAwarenessEnable)?;
        self.switch_and_check(CommandSwitch::ClearBitsAutoModeEnable)?;
        self.switch_and_check(CommandSwitch::WriteProductionStateAwarenessPreSolderingWrites)?;
        self.switch_and_check(CommandSwitch::WriteProductionStateAwarenessPreSolderingPostWrites)?;
        self.switch_and_check(CommandSwitch::WriteProductionStateAwarenessNormal)
    }

    fn change_to_ready_state(&mut self, bus_power: BusPower) -> SdResult {
        let mut timer = ManualTimer::new(READY_TIMEOUT_MS);
        loop {
            let ocr = self.issue_command_send_op_cond(bus_power)?;
            if ocr & OCR_CARD_POWER_UP_STATUS != 0 {
                let device = self.base.device_mut();
                device.set_ocr(ocr);
                device.set_high_capacity(ocr & OCR_ACCESS_MODE_MASK == OCR_ACCESS_MODE_SECTOR_MODE);
                return Ok(());
            }
            if !timer.update() {
                debug!("mmc: no power-up after {} ms, ocr {:#x}", READY_TIMEOUT_MS, ocr);
                return Err(SdError::MmcInitializationSoftwareTimeout);
            }
            wait_microseconds(1000);
        }
    }

    fn extend_bus_width(&mut self, max_bus_width: BusWidth) -> SdResult {
        if max_bus_width == BusWidth::OneBit {
            return Ok(());
        }
        let host = self.base.host();
        let (target, cs) = if max_bus_width == BusWidth::EightBit && host.is_supported_bus_width(BusWidth::EightBit) {
            (BusWidth::EightBit, CommandSwitch::WriteBusWidth8Bit)
        } else if host.is_supported_bus_width(BusWidth::FourBit) {
            (BusWidth::FourBit, CommandSwitch::WriteBusWidth4Bit)
        } else {
            return Ok(());
        };
        self.switch_and_check(cs)?;
        self.base.host_mut().set_bus_width(target);
        Ok(())
    }

    fn enable_bkops_auto(&mut self) -> SdResult {
        self.switch_and_check(CommandSwitch::SetBitsBkopsEnAutoEn)
    }

    fn change_to_high_speed(&mut self, check_before: bool) -> SdResult {
        self.issue_command_switch(CommandSwitch::WriteHsTimingHighSpeed)?;
        if check_before {
            self.base.issue_command_send_status(DeviceStatus::empty())?;
        }
        self.base.host_mut().set_speed_mode(SpeedMode::MmcHighSpeed)?;
        if !check_before {
            self.base.issue_command_send_status(DeviceStatus::empty())?;
        }
        Ok(())
    }

    fn change_to_hs200(&mut self) -> SdResult {
        self.issue_command_switch(CommandSwitch::WriteHsTimingHs200)?;
        let host = self.base.host_mut();
        host.set_speed_mode(SpeedMode::MmcHs200)?;
        host.tuning(SpeedMode::MmcHs200, cmd::SEND_TUNING_BLOCK_HS200)?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    /// HS400 is entered from a tuned HS200 bus via high speed and 8-bit DDR.
    fn change_to_hs400(&mut self) -> SdResult {
        self.change_to_hs200()?;
        self.base.host_mut().save_tuning_status_for_hs400();
        self.change_to_high_speed(false)?;
        self.issue_command_switch(CommandSwitch::WriteBusWidth8BitDdr)?;
        self.issue_command_switch(CommandSwitch::WriteHsTimingHs400)?;
        self.base.host_mut().set_speed_mode(SpeedMode::MmcHs400)?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    fn extend_bus_speed(&mut self, device_type: u8, max_speed_mode: SpeedMode) -> SdResult {
        let host = self.base.host();
        if host.is_supported_tuning() && host.bus_power() == BusPower::V1_8 {
            let bus_width = host.bus_width();
            if bus_width == BusWidth::EightBit
                && device_type & DEVICE_TYPE_HS400_1_8V != 0
                && max_speed_mode == SpeedMode::MmcHs400
            {
                return self.change_to_hs400();
            }
            if (bus_width == BusWidth::EightBit || bus_width == BusWidth::FourBit)
                && device_type & DEVICE_TYPE_HS200_1_8V != 0
                && (max_speed_mode == SpeedMode::MmcHs400 || max_speed_mode == SpeedMode::MmcHs200)
            {
                return self.change_to_hs200();
            }
        }
        if device_type & DEVICE_TYPE_HIGH_SPEED_52MHZ != 0 {
            return self.change_to_high_speed(true);
        }
        Ok(())
    }

    fn startup_mmc_device(&mut self, max_bus_width: BusWidth, max_speed_mode: SpeedMode) -> SdResult {
        let host = self.base.host_mut();
        let bus_power = if host.is_supported_bus_power(BusPower::V1_8) {
            BusPower::V1_8
        } else {
            BusPower::V3_3
        };
        host.startup(bus_power, BusWidth::OneBit, SpeedMode::MmcIdentification, false)?;
        wait_microseconds(1000);
        wait_clocks(74, host.device_clock_frequency_khz());

        self.base.issue_command_go_idle_state()?;
        self.current_partition = Some(MmcPartition::UserData);
        self.change_to_ready_state(bus_power)?;

        let cid = self.base.issue_command_all_send_cid()?;
        self.base.device_mut().set_cid(&cid);
        let is_toshiba = is_toshiba_mmc(&self.base.device().cid());
        self.issue_command_set_relative_addr()?;
        let csd = self.base.issue_command_send_csd()?;
        self.base.device_mut().set_csd(&csd);
        let spec_under_4 = is_less_than_specification_4(&self.base.device().csd());

        self.base.host_mut().set_speed_mode(SpeedMode::MmcLegacySpeed)?;
        self.base.issue_command_select_card()?;
        self.base.issue_command_set_block_len_to_sector_size()?;

        if spec_under_4 {
            debug!("mmc: pre-4.0 device, staying at legacy speed");
            return self.base.device_mut().set_legacy_memory_capacity();
        }

        self.extend_bus_width(max_bus_width)?;
        self.issue_command_send_ext_csd()?;
        let capacity = memory_capacity_from_ext_csd(&self.work_buffer[..]);
        self.base.device_mut().set_memory_capacity(capacity);

        if is_toshiba && !is_bkops_auto_enable(&self.work_buffer[..]) {
            if let Err(err) = self.enable_bkops_auto() {
                warn!("mmc: enabling automatic BKOPS failed: {:?}", err);
            }
        }

        let device_type = self.work_buffer[EXT_CSD_DEVICE_TYPE];
        self.extend_bus_speed(device_type, max_speed_mode)?;
        self.base.host_mut().set_power_saving(true);
        Ok(())
    }

    /// Timing the device reports in its extended CSD.
    pub fn speed_mode(&mut self) -> SdResult<SpeedMode> {
        self.read_extended_csd()?;
        speed_mode_from_ext_csd(&self.work_buffer[..])
    }

    pub fn put_to_sleep(&mut self) {
        if !self.base.device().is_awake() {
            return;
        }
        self.base.device_mut().put_to_sleep();
        if self.base.device().is_active() {
            self.base.host_mut().put_to_sleep();
        }
    }

    /// Wake the device. A controller that fails to come back is logged;
    /// the next access reports the failure.
    pub fn awaken(&mut self) {
        if self.base.device().is_awake() {
            return;
        }
        if self.base.device().is_active() {
            if let Err(err) = self.base.host_mut().awaken() {
                error!("mmc: awaken failed: {:?}", err);
                self.base.push_error_log(true, format_args!("A:{:X}", err.code()));
            }
        }
        self.base.device_mut().awaken();
    }

    pub fn select_partition(&mut self, partition: MmcPartition) -> SdResult {
        self.base.device().check_accessible()?;
        self.current_partition = None;
        self.switch_and_check(CommandSwitch::WritePartitionAccess(partition))?;
        self.current_partition = Some(partition);
        Ok(())
    }

    /// Erase the whole of the selected partition.
    pub fn erase(&mut self) -> SdResult {
        self.base.device().check_accessible()?;
        let partition = match self.current_partition {
            Some(p) => p,
            None => panic!("mmc: erase with no partition selected"),
        };
        let capacity = match partition {
            MmcPartition::UserData => self.base.device().memory_capacity(),
            MmcPartition::BootPartition1 | MmcPartition::BootPartition2 => self.boot_partition_capacity()?,
        };

        let last_sector = match capacity.checked_sub(1) {
            Some(last) => last,
            None => {
                debug!("mmc: {:?} is empty, nothing to erase", partition);
                return Ok(());
            }
        };

        self.issue_command_erase_group_start(0)?;
        self.issue_command_erase_group_end(last_sector)?;

        let mut timer = ManualTimer::new(ERASE_TIMEOUT_MS);
        match self.issue_command_erase() {
            Ok(())
            | Err(SdError::DataTimeoutError)
            | Err(SdError::CommandCompleteSoftwareTimeout)
            | Err(SdError::BusySoftwareTimeout) => {}
            Err(err) => return Err(err),
        }
        loop {
            match self.base.issue_command_send_status(DeviceStatus::empty()) {
                Ok(_) => break,
                Err(SdError::UnexpectedDeviceState) => {
                    if !timer.update() {
                        return Err(SdError::MmcEraseSoftwareTimeout);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if partition == MmcPartition::UserData && is_toshiba_mmc(&self.base.device().cid()) {
            if let Err(err) = self.cancel_toshiba_mmc_model() {
                warn!("mmc: production state reset after erase failed: {:?}", err);
            }
        }
        Ok(())
    }

    pub fn boot_partition_capacity(&mut self) -> SdResult<u32> {
        self.read_extended_csd()?;
        Ok(boot_partition_capacity_from_ext_csd(&self.work_buffer[..]))
    }

    fn read_extended_csd(&mut self) -> SdResult {
        self.base.device().check_accessible()?;
        if is_less_than_specification_4(&self.base.device().csd()) {
            return Err(SdError::MmcNotSupportExtendedCsd);
        }
        self.issue_command_send_ext_csd()
    }

    pub fn extended_csd(&mut self, dst: &mut [u8]) -> SdResult {
        assert!(dst.len() >= EXT_CSD_SIZE, "extended CSD needs {} bytes", EXT_CSD_SIZE);
        self.read_extended_csd()?;
        dst[..EXT_CSD_SIZE].copy_from_slice(&self.work_buffer[..]);
        Ok(())
    }
}

impl<H: HostController> DeviceAccessor for MmcDeviceAccessor<H> {
    type Host = H;

    fn base(&self) -> &BaseDeviceAccessor<H> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseDeviceAccessor<H> {
        &mut self.base
    }

    fn on_activate(&mut self) -> SdResult {
        let mut result = Ok(());
        for (i, &(bus_width, speed_mode)) in STARTUP_PARAMETERS.iter().enumerate() {
            self.max_bus_width = bus_width;
            self.max_speed_mode = speed_mode;
            match self.startup_mmc_device(bus_width, speed_mode) {
                Ok(()) => {
                    if i != 0 {
                        self.base.push_error_log(
                            true,
                            format_args!("S {} {}:0", bus_width.bits(), speed_mode.log_name()),
                        );
                        self.base.increment_activation_error_corrections();
                    }
                    info!("mmc: active, {}-bit {:?}", self.base.host().bus_width().bits(), self.base.host().speed_mode());
                    return Ok(());
                }
                Err(err) => {
                    debug!("mmc: startup {}-bit {:?} failed: {:?}", bus_width.bits(), speed_mode, err);
                    self.base.push_error_log(
                        false,
                        format_args!("S {} {}:{:X}", bus_width.bits(), speed_mode.log_name(), err.code()),
                    );
                    self.base.host_mut().shutdown();
                    result = Err(err);
                }
            }
        }
        error!("mmc: activation failed: {:?}", result);
        self.base.push_error_timestamp();
        result
    }

    fn on_read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult {
        let alignment = if buf.is_read() {
            0
        } else {
            assert!(
                sector_index % WRITE_SECTOR_ALIGNMENT == 0,
                "mmc: write at {:#x} is not 16 KiB aligned",
                sector_index
            );
            WRITE_SECTOR_ALIGNMENT
        };
        self.read_write_multiple(sector_index, num_sectors, alignment, buf)
    }

    fn re_startup(&mut self) -> SdResult {
        self.base.host_mut().shutdown();
        let (bus_width, speed_mode) = (self.max_bus_width, self.max_speed_mode);
        if let Err(err) = self.startup_mmc_device(bus_width, speed_mode) {
            self.base.push_error_log(
                false,
                format_args!("S {} {}:{:X}", bus_width.bits(), speed_mode.log_name(), err.code()),
            );
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::*;
    use super::*;
    use crate::hal::testing;

    const STATE_STBY: u32 = 3 << 9;
    const STATE_PRG: u32 = 7 << 9;

    struct MmcCard {
        op_cond_polls: u32,
        ready_after: u32,
        ocr: u32,
        cid: [u32; 4],
        csd: [u32; 4],
        ext_csd: [u8; EXT_CSD_SIZE],
        erase_busy_polls: u32,
        failing_switch: Option<u32>,
        switches: Vec<u32>,
        disk: Disk,
    }

    impl MmcCard {
        fn new() -> Self {
            let mut ext_csd = [0u8; EXT_CSD_SIZE];
            ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4].copy_from_slice(&128u32.to_le_bytes());
            ext_csd[EXT_CSD_DEVICE_TYPE] = DEVICE_TYPE_HIGH_SPEED_52MHZ | DEVICE_TYPE_HS200_1_8V | DEVICE_TYPE_HS400_1_8V;
            ext_csd[EXT_CSD_BKOPS_EN] = 0x02;
            ext_csd[EXT_CSD_BOOT_SIZE_MULT] = 2;
            Self {
                op_cond_polls: 0,
                ready_after: 2,
                ocr: OCR_CARD_POWER_UP_STATUS | OCR_ACCESS_MODE_SECTOR_MODE | 0x80,
                cid: [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x0015_0000],
                // SPEC_VERS 4
                csd: [0, 0, 0, 0x0010_0000],
                ext_csd,
                erase_busy_polls: 0,
                failing_switch: None,
                switches: Vec::new(),
                disk: Disk::new(128),
            }
        }

        fn toshiba(mut self) -> Self {
            self.cid[3] = 0x0011_0000;
            self
        }
    }

    impl Card for MmcCard {
        fn respond(&mut self, command: &Command, data: Option<&mut TransferData<'_>>) -> SdResult<[u32; 4]> {
            let tran = [STATE_TRAN, 0, 0, 0];
            match command.index {
                cmd::GO_IDLE_STATE => {
                    self.op_cond_polls = 0;
                    Ok([0; 4])
                }
                cmd::SEND_OP_COND => {
                    self.op_cond_polls += 1;
                    if self.op_cond_polls > self.ready_after {
                        Ok([self.ocr, 0, 0, 0])
                    } else {
                        Ok([self.ocr & !OCR_CARD_POWER_UP_STATUS, 0, 0, 0])
                    }
                }
                cmd::ALL_SEND_CID => Ok(self.cid),
                cmd::SEND_CSD => Ok(self.csd),
                cmd::SET_RELATIVE_ADDR | cmd::SELECT_CARD => Ok([STATE_STBY, 0, 0, 0]),
                cmd::SWITCH => {
                    if self.failing_switch == Some(command.argument) {
                        return Err(SdError::ResponseTimeoutError);
                    }
                    self.switches.push(command.argument);
                    Ok(tran)
                }
                cmd::SEND_EXT_CSD => {
                    match data.map(|x| &mut x.buffer) {
                        Some(TransferBuffer::Read(buf)) => buf[..EXT_CSD_SIZE].copy_from_slice(&self.ext_csd),
                        _ => panic!("CMD8 without a read buffer"),
                    }
                    Ok(tran)
                }
                cmd::SEND_STATUS if self.erase_busy_polls > 0 => {
                    self.erase_busy_polls -= 1;
                    Ok([STATE_PRG, 0, 0, 0])
                }
                cmd::READ_SINGLE_BLOCK | cmd::READ_MULTIPLE_BLOCK | cmd::WRITE_BLOCK | cmd::WRITE_MULTIPLE_BLOCK => {
                    self.disk.transfer(command, data)
                }
                _ => Ok(tran),
            }
        }
    }

    fn accessor(card: MmcCard) -> MmcDeviceAccessor<MockHost<MmcCard>> {
        testing::install();
        let mut host = MockHost::new(card);
        host.supported_powers = vec![BusPower::V1_8];
        let mut acc = MmcDeviceAccessor::new(host);
        acc.initialize();
        acc
    }

    fn host(acc: &MmcDeviceAccessor<MockHost<MmcCard>>) -> &MockHost<MmcCard> {
        acc.base.host()
    }

    #[test]
    fn activation_reaches_high_speed_on_eight_bits() {
        let mut acc = accessor(MmcCard::new());
        assert!(host(&acc).initialized);
        acc.activate().unwrap();
        let host = host(&acc);
        assert_eq!(host.startups[0], (BusPower::V1_8, BusWidth::OneBit, SpeedMode::MmcIdentification));
        assert_eq!(host.bus_width(), BusWidth::EightBit);
        assert_eq!(host.speed_mode(), FIRST_SPEED_MODE);
        assert!(host.is_power_saving_enable());
        assert_eq!(acc.memory_capacity(), Ok(128));
        assert_eq!(acc.rca(), Ok(crate::device::MMC_RCA));
        assert!(acc.base.device().is_high_capacity());
        assert_eq!(host.issued[1].0, cmd::SEND_OP_COND);
        assert_eq!(host.issued[1].1, OCR_ACCESS_MODE_SECTOR_MODE | 0x80);
        assert_eq!(host.count(cmd::SEND_OP_COND), 3);
        assert!(host.card.switches.contains(&0x03B7_0200));
    }

    #[test]
    fn hs400_goes_through_tuned_hs200() {
        let mut acc = accessor(MmcCard::new());
        acc.startup_mmc_device(BusWidth::EightBit, SpeedMode::MmcHs400).unwrap();
        let host = host(&acc);
        assert_eq!(host.tunings, vec![(SpeedMode::MmcHs200, cmd::SEND_TUNING_BLOCK_HS200)]);
        assert_eq!(host.hs400_saves, 1);
        assert_eq!(host.speed_mode(), SpeedMode::MmcHs400);
        assert_eq!(host.card.switches, vec![0x03B7_0200, 0x03B9_0200, 0x03B9_0100, 0x03B7_0600, 0x03B9_0300]);
    }

    #[test]
    fn hs200_needs_a_wide_bus() {
        let mut acc = accessor(MmcCard::new());
        acc.startup_mmc_device(BusWidth::OneBit, SpeedMode::MmcHs200).unwrap();
        let host = host(&acc);
        assert!(host.tunings.is_empty());
        assert_eq!(host.speed_mode(), SpeedMode::MmcHighSpeed);
        assert_eq!(host.card.switches, vec![0x03B9_0100]);
    }

    #[test]
    fn fallback_attempt_is_logged_as_correction() {
        let mut acc = accessor(MmcCard::new());
        acc.base.host_mut().startup_faults.push_back(SdError::ResponseTimeoutError);
        acc.activate().unwrap();
        assert_eq!(host(&acc).shutdowns, 1);
        assert_eq!(host(&acc).startups.len(), 2);
        let mut log = [0u8; 128];
        let (info, size) = acc.get_and_clear_error_info(Some(&mut log));
        assert_eq!(info.num_activation_error_corrections, 1);
        let text = core::str::from_utf8(&log[..size - 1]).unwrap();
        let entries: Vec<&str> = text.split(", ").collect();
        assert_eq!(entries[2], "S 8 MmcHs:0");
        assert_eq!(entries[3], format!("S 8 {}:25", FIRST_SPEED_MODE.log_name()));
    }

    #[test]
    fn every_attempt_failing_fails_activation() {
        let mut card = MmcCard::new();
        card.ready_after = u32::MAX;
        let mut acc = accessor(card);
        assert_eq!(acc.activate(), Err(SdError::MmcInitializationSoftwareTimeout));
        assert_eq!(host(&acc).shutdowns, 3);
        assert_eq!(host(&acc).startups[2].1, BusWidth::OneBit);
        let (info, _) = acc.get_and_clear_error_info(None);
        assert_eq!(info.num_activation_failures, 1);
    }

    #[test]
    fn legacy_device_skips_ext_csd() {
        let mut card = MmcCard::new();
        // SPEC_VERS 3, C_SIZE 0xFFF, C_SIZE_MULT 7, READ_BL_LEN 9
        card.csd = [0, (0x3FF << 22) | (7 << 7), (9 << 8) | 3, 0x000C_0000];
        card.ocr = OCR_CARD_POWER_UP_STATUS | 0x80;
        let mut acc = accessor(card);
        acc.activate().unwrap();
        assert_eq!(acc.memory_capacity(), Ok(4096 << 9));
        assert_eq!(host(&acc).count(cmd::SEND_EXT_CSD), 0);
        assert_eq!(host(&acc).speed_mode(), SpeedMode::MmcLegacySpeed);
        assert!(!acc.base.device().is_high_capacity());
        assert_eq!(acc.speed_mode(), Err(SdError::MmcNotSupportExtendedCsd));
    }

    #[test]
    fn toshiba_bkops_failure_is_tolerated() {
        let mut card = MmcCard::new().toshiba();
        card.ext_csd[EXT_CSD_BKOPS_EN] = 0;
        card.failing_switch = Some(CommandSwitch::SetBitsBkopsEnAutoEn.argument());
        let mut acc = accessor(card);
        acc.activate().unwrap();
        assert_eq!(host(&acc).startups.len(), 1);
    }

    #[test]
    fn writes_must_be_16k_aligned() {
        let mut acc = accessor(MmcCard::new());
        acc.activate().unwrap();
        let buf = vec![0x5Au8; 32 * SECTOR_SIZE];
        acc.write(32, 32, &buf).unwrap();
        assert!(host(&acc).card.disk.data[32 * SECTOR_SIZE..64 * SECTOR_SIZE].iter().all(|&b| b == 0x5A));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| acc.write(8, 1, &buf)));
        assert!(result.is_err());
    }

    #[test]
    fn speed_mode_comes_from_ext_csd() {
        let mut card = MmcCard::new();
        card.ext_csd[EXT_CSD_HS_TIMING] = 2;
        let mut acc = accessor(card);
        acc.activate().unwrap();
        assert_eq!(acc.speed_mode(), Ok(SpeedMode::MmcHs200));
        acc.base.host_mut().card.ext_csd[EXT_CSD_HS_TIMING] = 7;
        assert_eq!(acc.speed_mode(), Err(SdError::UnexpectedMmcExtendedCsdValue));
        let mut ext = [0u8; EXT_CSD_SIZE];
        acc.extended_csd(&mut ext).unwrap();
        assert_eq!(ext[EXT_CSD_BOOT_SIZE_MULT], 2);
    }

    #[test]
    fn boot_partition_erase_covers_the_partition() {
        let mut acc = accessor(MmcCard::new().toshiba());
        acc.activate().unwrap();
        acc.select_partition(MmcPartition::BootPartition1).unwrap();
        assert_eq!(acc.boot_partition_capacity(), Ok(512));
        acc.base.host_mut().card.erase_busy_polls = 3;
        acc.erase().unwrap();
        let host = host(&acc);
        assert!(host.issued.contains(&(cmd::ERASE_GROUP_START, 0)));
        assert!(host.issued.contains(&(cmd::ERASE_GROUP_END, 511)));
        assert_eq!(host.count(cmd::ERASE), 1);
        // no production-state reset outside the user area
        assert_eq!(host.card.switches.last(), Some(&0x03B3_0100));
    }

    #[test]
    fn empty_boot_partition_erases_nothing() {
        let mut card = MmcCard::new();
        card.ext_csd[EXT_CSD_BOOT_SIZE_MULT] = 0;
        let mut acc = accessor(card);
        acc.activate().unwrap();
        acc.select_partition(MmcPartition::BootPartition2).unwrap();
        assert_eq!(acc.boot_partition_capacity(), Ok(0));
        assert_eq!(acc.erase(), Ok(()));
        let host = host(&acc);
        assert_eq!(host.count(cmd::ERASE_GROUP_START), 0);
        assert_eq!(host.count(cmd::ERASE), 0);
    }

    #[test]
    fn toshiba_user_erase_resets_production_state() {
        let mut acc = accessor(MmcCard::new().toshiba());
        acc.activate().unwrap();
        acc.erase().unwrap();
        let switches = &host(&acc).card.switches;
        let tail = &switches[switches.len() - 5..];
        assert_eq!(tail, &[0x0111_0100, 0x0211_0200, 0x0385_0100, 0x0385_0200, 0x0385_0000]);
        assert!(host(&acc).issued.contains(&(cmd::ERASE_GROUP_END, 127)));
    }

    #[test]
    fn failed_partition_switch_is_reported() {
        let mut card = MmcCard::new();
        card.failing_switch = Some(CommandSwitch::WritePartitionAccess(MmcPartition::BootPartition2).argument());
        let mut acc = accessor(card);
        acc.activate().unwrap();
        assert_eq!(acc.select_partition(MmcPartition::BootPartition2), Err(SdError::ResponseTimeoutError));
        assert_eq!(acc.current_partition, None);
    }

    #[test]
    fn sleep_and_wake_follow_the_host() {
        let mut acc = accessor(MmcCard::new());
        acc.activate().unwrap();
        acc.put_to_sleep();
        acc.put_to_sleep();
        assert_eq!(host(&acc).sleeps, 1);
        assert_eq!(acc.memory_capacity(), Err(SdError::NotAwakened));
        acc.base.host_mut().awaken_fault = Some(SdError::SdmmcDllCalibrationSoftwareTimeout);
        acc.awaken();
        assert!(acc.base.device().is_awake());
        let mut log = [0u8; 64];
        let (_, size) = acc.get_and_clear_error_info(Some(&mut log));
        assert!(core::str::from_utf8(&log[..size - 1]).unwrap().contains("A:84"));
    }

    #[test]
    fn finalize_deactivates() {
        let mut acc = accessor(MmcCard::new());
        acc.activate().unwrap();
        acc.finalize();
        assert!(!host(&acc).initialized);
        assert_eq!(host(&acc).shutdowns, 1);
        assert!(!acc.base.device().is_active());
    }
}

//! Device accessors: activation, block transfers and the shared recovery
//! policy, over any [`HostController`].

use crate::device::{Device, DeviceState, DeviceStatus, CID_SIZE, CSD_SIZE};
use crate::error::{SdError, SdResult};
use crate::host::*;
use crate::timer::get_us;
use core::fmt;

mod gc_asic;
pub mod logger;
mod mmc;
mod sd_card;

#[cfg(test)]
pub(crate) mod mock;

pub use gc_asic::{GcAsicDeviceAccessor, GC_ASIC_OPERATION_SIZE};
pub use mmc::{MmcDeviceAccessor, MmcPartition};
pub use sd_card::{SdCardDeviceAccessor, SdCardSwitchFunction, SD_STATUS_SIZE, SWITCH_FUNCTION_STATUS_SIZE};

use logger::ErrorLogger;

/// Failure and recovery counters, cleared whenever they are read.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct ErrorInfo {
    pub num_activation_failures: u32,
    pub num_activation_error_corrections: u32,
    pub num_read_write_failures: u32,
    pub num_read_write_error_corrections: u32,
}

/// What to try before the next attempt at a failed transfer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Recovery {
    None,
    Retry,
    ReStartup,
}

impl Recovery {
    fn next(self) -> Self {
        match self {
            Recovery::None => Recovery::Retry,
            Recovery::Retry | Recovery::ReStartup => Recovery::ReStartup,
        }
    }
}

/// Device record and host controller of one slot, with the command helpers
/// every device kind shares.
pub struct BaseDeviceAccessor<H> {
    host: H,
    device: Device,
    error_info: ErrorInfo,
    logger: ErrorLogger,
}

impl<H: HostController> BaseDeviceAccessor<H> {
    pub fn new(host: H, device: Device) -> Self {
        Self {
            host,
            device,
            error_info: ErrorInfo::default(),
            logger: ErrorLogger::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn push_error_timestamp(&mut self) {
        let seconds = get_us() / 1_000_000;
        self.logger.push(format_args!("{}", seconds));
    }

    pub fn push_error_log(&mut self, with_timestamp: bool, args: fmt::Arguments<'_>) {
        self.logger.push(args);
        if with_timestamp {
            self.push_error_timestamp();
        }
    }

    pub fn increment_activation_error_corrections(&mut self) {
        self.error_info.num_activation_error_corrections += 1;
    }

    /// Issue an R1 command and check both the error bits and, unless
    /// `expected_state` is `Unknown`, the state the device reports.
    pub fn issue_command_and_check_r1(
        &mut self,
        index: u32,
        argument: u32,
        is_busy: bool,
        expected_state: DeviceState,
        ignore: DeviceStatus,
    ) -> SdResult<u32> {
        let command = Command::new(index, argument, ResponseType::R1, is_busy);
        self.host.issue_command(&command, None)?;
        let status = self.host.last_response(ResponseType::R1)[0] & !ignore.bits();
        self.device.check_device_status(status)?;
        if expected_state != DeviceState::Unknown && DeviceState::from_status(status) != expected_state {
            debug!("CMD{}: device in {:?}, expected {:?}", index, DeviceState::from_status(status), expected_state);
            return Err(SdError::UnexpectedDeviceState);
        }
        Ok(status)
    }

    pub fn issue_command_go_idle_state(&mut self) -> SdResult {
        let command = Command::new(cmd::GO_IDLE_STATE, 0, ResponseType::R0, false);
        self.host.issue_command(&command, None).map(|_| ())
    }

    pub fn issue_command_all_send_cid(&mut self) -> SdResult<[u32; 4]> {
        let command = Command::new(cmd::ALL_SEND_CID, 0, ResponseType::R2, false);
        self.host.issue_command(&command, None)?;
        Ok(self.host.last_response(ResponseType::R2))
    }

    pub fn issue_command_select_card(&mut self) -> SdResult {
        let argument = u32::from(self.device.rca()) << 16;
        self.issue_command_and_check_r1(cmd::SELECT_CARD, argument, true, DeviceState::Unknown, DeviceStatus::empty())
            .map(|_| ())
    }

    pub fn issue_command_send_csd(&mut self) -> SdResult<[u32; 4]> {
        let argument = u32::from(self.device.rca()) << 16;
        let command = Command::new(cmd::SEND_CSD, argument, ResponseType::R2, false);
        self.host.issue_command(&command, None)?;
        Ok(self.host.last_response(ResponseType::R2))
    }

    /// CMD13, requiring the device to be in Tran.
    pub fn issue_command_send_status(&mut self, ignore: DeviceStatus) -> SdResult<u32> {
        let argument = u32::from(self.device.rca()) << 16;
        self.issue_command_and_check_r1(cmd::SEND_STATUS, argument, false, DeviceState::Tran, ignore)
    }

    pub fn issue_command_set_block_len_to_sector_size(&mut self) -> SdResult {
        self.issue_command_and_check_r1(
            cmd::SET_BLOCKLEN,
            SECTOR_SIZE as u32,
            false,
            DeviceState::Tran,
            DeviceStatus::empty(),
        )
        .map(|_| ())
    }

    /// A read that ends exactly at the last sector is expected to trip
    /// ADDRESS_OUT_OF_RANGE on the trailing CMD12.
    fn out_of_range_mask(&self, is_read: bool, sector_index: u32, num_transferred: u32) -> DeviceStatus {
        if is_read && sector_index + num_transferred == self.device.memory_capacity() {
            DeviceStatus::ADDRESS_OUT_OF_RANGE
        } else {
            DeviceStatus::empty()
        }
    }

    /// Pick the most useful error after a failed data phase. Removal wins;
    /// then a status error from the stop or status commands wins over the
    /// transport error.
    fn resolve_transfer_error(&mut self, err: SdError) -> SdError {
        if self.device.is_removed() {
            return SdError::DeviceRemoved;
        }
        let mut resolved = err;
        if let Ok(response) = self.host.issue_stop_transmission_command() {
            let status = response & !DeviceStatus::ILLEGAL_COMMAND.bits();
            if let Err(status_err) = self.device.check_device_status(status) {
                resolved = status_err;
            }
        }
        if self.device.is_removed() {
            return SdError::DeviceRemoved;
        }
        if let Err(status_err) = self.issue_command_send_status(DeviceStatus::ILLEGAL_COMMAND) {
            if !resolved.is_device_status_error() && status_err.is_device_status_error() {
                resolved = status_err;
            }
        }
        resolved
    }

    /// Argument of a data command: the sector number, or its byte offset on
    /// a byte-addressed device.
    fn data_address(&self, sector_index: u32) -> SdResult<u32> {
        if self.device.is_high_capacity() {
            return Ok(sector_index);
        }
        sector_index
            .checked_mul(SECTOR_SIZE as u32)
            .ok_or(SdError::DeviceStatusAddressOutOfRange)
    }

    /// Byte-addressed devices only reach the first 4 GiB.
    pub fn check_address_range(&self, sector_index: u32, num_sectors: u32) -> SdResult {
        if self.device.is_high_capacity() {
            return Ok(());
        }
        let end = (u64::from(sector_index) + u64::from(num_sectors)) * SECTOR_SIZE as u64;
        if end > u64::from(u32::MAX) + 1 {
            debug!("{:#x}+{} is beyond byte addressing", sector_index, num_sectors);
            return Err(SdError::DeviceStatusAddressOutOfRange);
        }
        Ok(())
    }

    /// One data command over `num_sectors` sectors, returning how many moved.
    pub fn issue_command_multiple_block(
        &mut self,
        sector_index: u32,
        num_sectors: u32,
        buf: TransferBuffer<'_>,
    ) -> SdResult<u32> {
        let is_read = buf.is_read();
        let argument = self.data_address(sector_index)?;
        let index = match (is_read, num_sectors > 1) {
            (true, true) => cmd::READ_MULTIPLE_BLOCK,
            (true, false) => cmd::READ_SINGLE_BLOCK,
            (false, true) => cmd::WRITE_MULTIPLE_BLOCK,
            (false, false) => cmd::WRITE_BLOCK,
        };
        let command = Command::new(index, argument, ResponseType::R1, false);
        let mut xfer = TransferData::new(buf, SECTOR_SIZE as u32, num_sectors);
        let num_transferred = match self.host.issue_command(&command, Some(&mut xfer)) {
            Ok(n) => n,
            Err(err) => {
                debug!("CMD{} {:#x}+{} failed: {:?}", index, sector_index, num_sectors, err);
                return Err(self.resolve_transfer_error(err));
            }
        };
        let status = self.host.last_response(ResponseType::R1)[0];
        self.device.check_device_status(status)?;
        if xfer.is_stop_transmission_auto {
            let mask = self.out_of_range_mask(is_read, sector_index, num_transferred);
            let stop_status = self.host.last_stop_transmission_response();
            self.device.check_device_status(stop_status & !mask.bits())?;
        }
        Ok(num_transferred)
    }

    /// One data command followed by a status check.
    pub fn read_write_single(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult<u32> {
        let is_read = buf.is_read();
        let num_transferred = self.issue_command_multiple_block(sector_index, num_sectors, buf)?;
        let mask = self.out_of_range_mask(is_read, sector_index, num_transferred);
        self.issue_command_send_status(mask)?;
        Ok(num_transferred)
    }
}

/// The operations every device slot offers. Kind-specific accessors supply
/// the identification sequence and the transfer policy; activation,
/// recovery and the getters are shared.
pub trait DeviceAccessor {
    type Host: HostController;

    fn base(&self) -> &BaseDeviceAccessor<Self::Host>;
    fn base_mut(&mut self) -> &mut BaseDeviceAccessor<Self::Host>;

    /// Bring the device from power-off to transfer state.
    fn on_activate(&mut self) -> SdResult;
    fn on_read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult;
    /// Power-cycle the bus and identify the device again.
    fn re_startup(&mut self) -> SdResult;

    /// Checks that run after the awake/active checks of `activate`.
    fn prepare_activation(&mut self) -> SdResult {
        Ok(())
    }

    fn activate(&mut self) -> SdResult {
        let device = self.base().device();
        if !device.is_awake() {
            return Err(SdError::NotAwakened);
        }
        if device.is_active() {
            return Ok(());
        }
        self.prepare_activation()?;
        if let Err(err) = self.on_activate() {
            self.base_mut().error_info.num_activation_failures += 1;
            return Err(err);
        }
        self.base_mut().device.set_active();
        Ok(())
    }

    fn deactivate(&mut self) {
        let base = self.base_mut();
        if base.device.is_active() {
            base.host.shutdown();
            base.device.deactivate();
        }
    }

    fn read(&mut self, sector_index: u32, num_sectors: u32, buf: &mut [u8]) -> SdResult {
        self.read_write(sector_index, num_sectors, TransferBuffer::Read(buf))
    }

    fn write(&mut self, sector_index: u32, num_sectors: u32, buf: &[u8]) -> SdResult {
        self.read_write(sector_index, num_sectors, TransferBuffer::Write(buf))
    }

    fn read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult {
        self.base().device.check_accessible()?;
        let result = self
            .base()
            .check_address_range(sector_index, num_sectors)
            .and_then(|()| self.on_read_write(sector_index, num_sectors, buf));
        if let Err(err) = result {
            self.base_mut().error_info.num_read_write_failures += 1;
            return Err(err);
        }
        Ok(())
    }

    /// Move `num_sectors` sectors in chunks the controller can take in one
    /// command, keeping every chunk start a multiple of `alignment` when it
    /// is non-zero. Each chunk is tried as-is, then once more, then once
    /// after a full re-startup.
    fn read_write_multiple(
        &mut self,
        sector_index: u32,
        num_sectors: u32,
        alignment: u32,
        mut buf: TransferBuffer<'_>,
    ) -> SdResult {
        if num_sectors == 0 {
            return Ok(());
        }
        assert!(
            buf.len() / SECTOR_SIZE >= num_sectors as usize,
            "buffer holds fewer than {} sectors",
            num_sectors
        );
        let max_blocks = self.base().host.max_transfer_num_blocks();
        let mut cur_sector = sector_index;
        let mut remaining = num_sectors;
        let mut offset = 0;
        while remaining > 0 {
            if alignment > 0 {
                assert!(cur_sector % alignment == 0, "sector {:#x} is not aligned to {}", cur_sector, alignment);
            }
            let mut chunk = remaining;
            if remaining > max_blocks {
                chunk = if alignment > 0 {
                    max_blocks - max_blocks % alignment
                } else {
                    max_blocks
                };
            }
            let len = chunk as usize * SECTOR_SIZE;
            let num_transferred = self.transfer_with_recovery(cur_sector, chunk, buf.slice(offset, len))?;
            assert!(remaining >= num_transferred);
            remaining -= num_transferred;
            cur_sector += num_transferred;
            offset += num_transferred as usize * SECTOR_SIZE;
        }
        Ok(())
    }

    #[doc(hidden)]
    fn transfer_with_recovery(&mut self, sector_index: u32, num_sectors: u32, mut buf: TransferBuffer<'_>) -> SdResult<u32> {
        let tag = if buf.is_read() { "R" } else { "W" };
        let len = buf.len();
        let mut step = Recovery::None;
        loop {
            if step == Recovery::ReStartup {
                self.re_startup()?;
            }
            let result = self.base_mut().read_write_single(sector_index, num_sectors, buf.slice(0, len));
            match (result, step) {
                (Ok(n), Recovery::ReStartup) => {
                    let base = self.base_mut();
                    base.push_error_log(true, format_args!("{} {:X} {:X}:0", tag, sector_index, num_sectors));
                    base.error_info.num_read_write_error_corrections += 1;
                    info!("{} {:#x}+{} recovered after re-startup", tag, sector_index, num_sectors);
                    return Ok(n);
                }
                (Ok(n), _) => return Ok(n),
                (Err(err), Recovery::ReStartup) => {
                    error!("{} {:#x}+{} failed after re-startup: {:?}", tag, sector_index, num_sectors, err);
                    self.base_mut().push_error_log(
                        true,
                        format_args!("{} {:X} {:X}:{:X}", tag, sector_index, num_sectors, err.code()),
                    );
                    return Err(err);
                }
                (Err(err), _) => {
                    self.base().device.check_removed()?;
                    self.base_mut().push_error_log(
                        false,
                        format_args!("{} {:X} {:X}:{:X}", tag, sector_index, num_sectors, err.code()),
                    );
                    step = step.next();
                }
            }
        }
    }

    fn check_connection(&mut self) -> SdResult<(SpeedMode, BusWidth)> {
        let base = self.base();
        base.device.check_accessible()?;
        let speed_mode = base.host.speed_mode();
        let bus_width = base.host.bus_width();
        base.host.internal_status()?;
        Ok((speed_mode, bus_width))
    }

    fn memory_capacity(&self) -> SdResult<u32> {
        self.base().device.check_accessible()?;
        Ok(self.base().device.memory_capacity())
    }

    fn device_status(&mut self) -> SdResult<u32> {
        self.base().device.check_accessible()?;
        self.base_mut().issue_command_send_status(DeviceStatus::empty())
    }

    fn ocr(&self) -> SdResult<u32> {
        self.base().device.check_accessible()?;
        Ok(self.base().device.ocr())
    }

    fn rca(&self) -> SdResult<u16> {
        self.base().device.check_accessible()?;
        Ok(self.base().device.rca())
    }

    fn cid(&self) -> SdResult<[u8; CID_SIZE]> {
        self.base().device.check_accessible()?;
        Ok(self.base().device.cid())
    }

    fn csd(&self) -> SdResult<[u8; CSD_SIZE]> {
        self.base().device.check_accessible()?;
        Ok(self.base().device.csd())
    }

    /// Take the counters and, when `log_buf` is given, drain the error log
    /// into it. The returned size counts the NUL terminator, or is zero
    /// when there was nothing logged.
    fn get_and_clear_error_info(&mut self, log_buf: Option<&mut [u8]>) -> (ErrorInfo, usize) {
        let base = self.base_mut();
        let info = core::mem::take(&mut base.error_info);
        let log_size = match log_buf {
            Some(buf) if base.logger.has_log() => {
                base.push_error_timestamp();
                base.logger.get_and_clear_logs(buf)
            }
            _ => 0,
        };
        (info, log_size)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::device::DeviceType;
    use crate::hal::{testing, AtomicEvent, Event};
    use alloc::sync::Arc;

    struct TestAccessor {
        base: BaseDeviceAccessor<MockHost<Disk>>,
        activations: u32,
        restartups: u32,
        activation_fault: Option<SdError>,
        alignment: u32,
    }

    impl TestAccessor {
        fn new(num_sectors: usize) -> Self {
            testing::install();
            let host = MockHost::new(Disk::new(num_sectors));
            Self {
                base: BaseDeviceAccessor::new(host, Device::new(DeviceType::Mmc)),
                activations: 0,
                restartups: 0,
                activation_fault: None,
                alignment: 0,
            }
        }

        fn active(num_sectors: usize) -> Self {
            let mut acc = Self::new(num_sectors);
            acc.activate().unwrap();
            acc
        }

        fn disk(&mut self) -> &mut Disk {
            &mut self.base.host_mut().card
        }
    }

    impl DeviceAccessor for TestAccessor {
        type Host = MockHost<Disk>;

        fn base(&self) -> &BaseDeviceAccessor<Self::Host> {
            &self.base
        }

        fn base_mut(&mut self) -> &mut BaseDeviceAccessor<Self::Host> {
            &mut self.base
        }

        fn on_activate(&mut self) -> SdResult {
            self.activations += 1;
            if let Some(err) = self.activation_fault.take() {
                return Err(err);
            }
            let capacity = self.base.host().card.num_sectors();
            let device = self.base.device_mut();
            device.set_high_capacity(true);
            device.set_memory_capacity(capacity);
            device.set_ocr(0xC0FF_8080);
            Ok(())
        }

        fn on_read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult {
            let alignment = self.alignment;
            self.read_write_multiple(sector_index, num_sectors, alignment, buf)
        }

        fn re_startup(&mut self) -> SdResult {
            self.restartups += 1;
            Ok(())
        }
    }

    #[test]
    fn activate_is_idempotent() {
        let mut acc = TestAccessor::new(8);
        assert_eq!(acc.memory_capacity(), Err(SdError::NotActivated));
        acc.activate().unwrap();
        acc.activate().unwrap();
        assert_eq!(acc.activations, 1);
        assert_eq!(acc.memory_capacity(), Ok(8));
        assert_eq!(acc.ocr(), Ok(0xC0FF_8080));
        assert_eq!(acc.rca(), Ok(2));
    }

    #[test]
    fn activation_failures_are_counted() {
        let mut acc = TestAccessor::new(8);
        acc.activation_fault = Some(SdError::ResponseTimeoutError);
        assert_eq!(acc.activate(), Err(SdError::ResponseTimeoutError));
        assert!(!acc.base.device().is_active());
        acc.activate().unwrap();
        let (info, log_size) = acc.get_and_clear_error_info(None);
        assert_eq!(info.num_activation_failures, 1);
        assert_eq!(log_size, 0);
        assert_eq!(acc.get_and_clear_error_info(None).0, ErrorInfo::default());
    }

    #[test]
    fn asleep_device_is_not_activated() {
        let mut acc = TestAccessor::new(8);
        acc.base.device_mut().put_to_sleep();
        assert_eq!(acc.activate(), Err(SdError::NotAwakened));
        assert_eq!(acc.activations, 0);
    }

    #[test]
    fn zero_sectors_touch_nothing() {
        let mut acc = TestAccessor::active(8);
        acc.read(0, 0, &mut []).unwrap();
        assert!(acc.base.host().issued.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut acc = TestAccessor::active(64);
        let pattern: Vec<u8> = (0..4 * SECTOR_SIZE).map(|i| (i * 7) as u8).collect();
        acc.write(10, 4, &pattern).unwrap();
        let mut back = vec![0u8; 4 * SECTOR_SIZE];
        acc.read(10, 4, &mut back).unwrap();
        assert_eq!(back, pattern);
        let indices = acc.base.host().indices();
        assert_eq!(
            indices,
            vec![cmd::WRITE_MULTIPLE_BLOCK, cmd::SEND_STATUS, cmd::READ_MULTIPLE_BLOCK, cmd::SEND_STATUS]
        );
    }

    #[test]
    fn single_sector_uses_single_block_commands() {
        let mut acc = TestAccessor::active(8);
        let mut buf = [0u8; SECTOR_SIZE];
        acc.read(3, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 3));
        acc.write(3, 1, &buf).unwrap();
        assert_eq!(acc.disk().transfers, vec![(cmd::READ_SINGLE_BLOCK, 3, 1), (cmd::WRITE_BLOCK, 3, 1)]);
    }

    #[test]
    fn byte_addressed_devices_get_byte_offsets() {
        let mut acc = TestAccessor::active(64);
        acc.base.device_mut().set_high_capacity(false);
        acc.disk().byte_addressed = true;
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        acc.read(2, 2, &mut buf).unwrap();
        assert_eq!(acc.base.host().issued[0], (cmd::READ_MULTIPLE_BLOCK, 2 * SECTOR_SIZE as u32));
        assert!(buf[SECTOR_SIZE..].iter().all(|&b| b == 3));
    }

    #[test]
    fn byte_addresses_stop_at_4_gib() {
        let mut acc = TestAccessor::active(16);
        acc.base.device_mut().set_high_capacity(false);
        acc.disk().byte_addressed = true;
        assert_eq!(acc.base.check_address_range(0x007F_FFFF, 1), Ok(()));
        assert_eq!(
            acc.base.check_address_range(0x007F_FFFF, 2),
            Err(SdError::DeviceStatusAddressOutOfRange)
        );

        let mut buf = vec![0u8; SECTOR_SIZE];
        assert_eq!(acc.read(0x0080_0001, 1, &mut buf), Err(SdError::DeviceStatusAddressOutOfRange));
        assert!(acc.base.host().issued.is_empty());
        assert_eq!(acc.base.error_info.num_read_write_failures, 1);

        assert_eq!(
            acc.base
                .issue_command_multiple_block(0x0080_0000, 1, TransferBuffer::Read(&mut buf)),
            Err(SdError::DeviceStatusAddressOutOfRange)
        );
        assert!(acc.base.host().issued.is_empty());

        // sector addressing has no such limit
        acc.base.device_mut().set_high_capacity(true);
        assert_eq!(acc.base.check_address_range(0x0080_0001, 1), Ok(()));
    }

    #[test]
    fn chunks_tile_the_request() {
        let mut acc = TestAccessor::active(256);
        acc.base.host_mut().max_blocks = 40;
        acc.alignment = 16;
        let mut buf = vec![0u8; 100 * SECTOR_SIZE];
        acc.read(32, 100, &mut buf).unwrap();
        assert_eq!(
            acc.disk().transfers,
            vec![
                (cmd::READ_MULTIPLE_BLOCK, 32, 32),
                (cmd::READ_MULTIPLE_BLOCK, 64, 32),
                // a tail that fits in one command is taken whole
                (cmd::READ_MULTIPLE_BLOCK, 96, 36),
            ]
        );
        for (i, sector) in buf.chunks(SECTOR_SIZE).enumerate() {
            assert!(sector.iter().all(|&b| b == (32 + i) as u8));
        }
    }

    #[test]
    fn oversized_chunks_round_down_to_alignment() {
        let mut acc = TestAccessor::active(256);
        acc.base.host_mut().max_blocks = 40;
        acc.alignment = 16;
        let buf = vec![0x5Au8; 90 * SECTOR_SIZE];
        acc.write(0, 90, &buf).unwrap();
        assert_eq!(
            acc.disk().transfers,
            vec![
                (cmd::WRITE_MULTIPLE_BLOCK, 0, 32),
                (cmd::WRITE_MULTIPLE_BLOCK, 32, 32),
                (cmd::WRITE_MULTIPLE_BLOCK, 64, 26),
            ]
        );

        acc.disk().transfers.clear();
        acc.alignment = 0;
        acc.write(100, 90, &buf).unwrap();
        assert_eq!(
            acc.disk().transfers,
            vec![
                (cmd::WRITE_MULTIPLE_BLOCK, 100, 40),
                (cmd::WRITE_MULTIPLE_BLOCK, 140, 40),
                (cmd::WRITE_MULTIPLE_BLOCK, 180, 10),
            ]
        );
    }

    #[test]
    #[should_panic]
    fn misaligned_start_aborts() {
        let mut acc = TestAccessor::active(64);
        acc.alignment = 32;
        let mut buf = vec![0u8; SECTOR_SIZE];
        let _ = acc.read(3, 1, &mut buf);
    }

    #[test]
    #[should_panic]
    fn undersized_buffer_aborts() {
        let mut acc = TestAccessor::active(64);
        let mut buf = vec![0u8; SECTOR_SIZE];
        let _ = acc.read(0, 2, &mut buf);
    }

    #[test]
    fn one_failure_is_retried_once() {
        let mut acc = TestAccessor::active(16);
        acc.disk().faults.push_back(SdError::DataCrcError);
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        acc.read(4, 2, &mut buf).unwrap();
        assert_eq!(acc.restartups, 0);
        assert_eq!(acc.disk().transfers.len(), 2);
        let (info, _) = acc.get_and_clear_error_info(None);
        assert_eq!(info.num_read_write_failures, 0);
        assert_eq!(info.num_read_write_error_corrections, 0);
    }

    #[test]
    fn two_failures_restart_the_device() {
        let mut acc = TestAccessor::active(16);
        acc.disk().faults.extend([SdError::DataCrcError, SdError::DataTimeoutError].iter().copied());
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        acc.read(4, 2, &mut buf).unwrap();
        assert_eq!(acc.restartups, 1);
        assert_eq!(acc.disk().transfers.len(), 3);
        let mut log = [0u8; 128];
        let (info, size) = acc.get_and_clear_error_info(Some(&mut log));
        assert_eq!(info.num_read_write_error_corrections, 1);
        let text = core::str::from_utf8(&log[..size - 1]).unwrap();
        let entries: Vec<&str> = text.split(", ").collect();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[2], "R 4 2:0");
        assert_eq!(entries[3], "R 4 2:28");
        assert_eq!(entries[4], "R 4 2:27");
    }

    #[test]
    fn three_failures_propagate() {
        let mut acc = TestAccessor::active(16);
        acc.disk()
            .faults
            .extend([SdError::DataCrcError, SdError::DataCrcError, SdError::DataEndBitError].iter().copied());
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        assert_eq!(acc.read(4, 2, &mut buf), Err(SdError::DataEndBitError));
        assert_eq!(acc.restartups, 1);
        assert_eq!(acc.disk().transfers.len(), 3);
        let (info, _) = acc.get_and_clear_error_info(None);
        assert_eq!(info.num_read_write_failures, 1);
    }

    #[test]
    fn status_error_is_preferred_over_transport_error() {
        let mut acc = TestAccessor::active(16);
        acc.disk().faults.extend([SdError::DataTimeoutError; 3].iter().copied());
        acc.disk().stop_status = status_with(DeviceStatus::WP_VIOLATION | DeviceStatus::ILLEGAL_COMMAND);
        let buf = vec![0u8; 2 * SECTOR_SIZE];
        assert_eq!(acc.write(0, 2, &buf), Err(SdError::DeviceStatusWpViolation));
        assert_eq!(acc.base.host().count(cmd::STOP_TRANSMISSION), 3);
    }

    #[test]
    fn removal_short_circuits_recovery() {
        let mut acc = TestAccessor::new(16);
        let removed: Arc<dyn Event> = Arc::new(AtomicEvent::new());
        *acc.base.device_mut() = Device::new(DeviceType::SdCard).with_removed_event(removed.clone());
        acc.base.device_mut().set_rca(1);
        acc.activate().unwrap();
        acc.disk().faults.push_back(SdError::DataCrcError);
        acc.disk().removed_on_fault = Some(removed);
        acc.disk().stop_status = status_with(DeviceStatus::COM_CRC_ERROR);
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        assert_eq!(acc.read(0, 2, &mut buf), Err(SdError::DeviceRemoved));
        assert_eq!(acc.restartups, 0);
        assert_eq!(acc.disk().transfers.len(), 1);
        assert_eq!(acc.base.host().count(cmd::STOP_TRANSMISSION), 0);
    }

    #[test]
    fn read_up_to_capacity_masks_out_of_range() {
        let mut acc = TestAccessor::active(16);
        acc.disk().stop_status = status_with(DeviceStatus::ADDRESS_OUT_OF_RANGE);
        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        acc.read(12, 4, &mut buf).unwrap();
        assert_eq!(acc.read(8, 4, &mut buf), Err(SdError::DeviceStatusAddressOutOfRange));
    }

    #[test]
    fn connection_check_reports_bus_state() {
        let mut acc = TestAccessor::active(16);
        let (speed, width) = acc.check_connection().unwrap();
        assert_eq!(speed, acc.base.host().speed_mode());
        assert_eq!(width, BusWidth::OneBit);
        acc.base.host_mut().internal_status = Err(SdError::SdmmcCompOpen);
        assert_eq!(acc.check_connection(), Err(SdError::SdmmcCompOpen));
    }

    #[test]
    fn deactivate_shuts_the_host_down() {
        let mut acc = TestAccessor::active(16);
        acc.deactivate();
        acc.deactivate();
        assert_eq!(acc.base.host().shutdowns, 1);
        assert_eq!(acc.cid(), Err(SdError::NotActivated));
    }
}

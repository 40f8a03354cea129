//! Game-card ASIC: a fixed 1.8 V 8-bit link with vendor operation commands.

use super::*;
use crate::device::DeviceType;
use crate::hal::{AtomicEvent, Event};
use crate::timer::wait_clocks;
use alloc::sync::Arc;

/// Size of the operation block sent with CMD60.
pub const GC_ASIC_OPERATION_SIZE: usize = 0x40;

pub struct GcAsicDeviceAccessor<H> {
    base: BaseDeviceAccessor<H>,
    is_initialized: bool,
}

impl<H: HostController> GcAsicDeviceAccessor<H> {
    pub fn new(host: H) -> Self {
        let removed_event: Arc<dyn Event> = Arc::new(AtomicEvent::new());
        let device = Device::new(DeviceType::GcAsic).with_removed_event(removed_event);
        Self {
            base: BaseDeviceAccessor::new(host, device),
            is_initialized: false,
        }
    }

    pub fn initialize(&mut self) {
        if self.is_initialized {
            return;
        }
        let event = self.base.device().removed_event();
        let host = self.base.host_mut();
        host.set_removed_event(event);
        host.initialize();
        self.is_initialized = true;
        info!("gc: initialized");
    }

    pub fn finalize(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_initialized = false;
        self.deactivate();
        self.base.host_mut().finalize();
    }

    fn startup_gc_asic_device(&mut self) -> SdResult {
        let host = self.base.host_mut();
        host.startup(BusPower::V1_8, BusWidth::EightBit, SpeedMode::GcAsicSpeed, false)?;
        wait_clocks(10, host.device_clock_frequency_khz());
        assert!(host.is_supported_tuning(), "gc: controller cannot tune");
        host.tuning(SpeedMode::GcAsicSpeed, cmd::SEND_TUNING_BLOCK_HS200)?;

        let device = self.base.device_mut();
        device.set_high_capacity(false);
        device.set_memory_capacity(0);
        self.base.host_mut().set_power_saving(true);
        Ok(())
    }

    fn issue_command_write_operation(&mut self, op_buf: &[u8]) -> SdResult {
        assert!(op_buf.len() >= GC_ASIC_OPERATION_SIZE, "gc: operation buffer too small");
        let command = Command::new(cmd::GC_ASIC_WRITE_OPERATION, 0, ResponseType::R1, false);
        let mut xfer = TransferData::write(
            &op_buf[..GC_ASIC_OPERATION_SIZE],
            GC_ASIC_OPERATION_SIZE as u32,
            1,
        );
        if let Err(err) = self.base.host_mut().issue_command(&command, Some(&mut xfer)) {
            debug!("gc: CMD60 failed: {:?}", err);
            self.base.device().check_removed()?;
            let mut resolved = err;
            if let Ok(response) = self.base.host_mut().issue_stop_transmission_command() {
                if let Err(status_err) = self.base.device().check_device_status(response) {
                    resolved = status_err;
                }
            }
            self.base.device().check_removed()?;
            if let Err(status_err) = self.base.issue_command_send_status(DeviceStatus::empty()) {
                if !resolved.is_device_status_error() && status_err.is_device_status_error() {
                    resolved = status_err;
                }
            }
            return Err(resolved);
        }
        let status = self.base.host().last_response(ResponseType::R1)[0];
        self.base.device().check_device_status(status)
    }

    fn issue_vendor_command(&mut self, index: u32) -> SdResult {
        self.base.device().check_accessible()?;
        self.base
            .issue_command_and_check_r1(index, 0, true, DeviceState::Tran, DeviceStatus::empty())?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    /// Send one operation block (CMD60).
    pub fn write_operation(&mut self, op_buf: &[u8]) -> SdResult {
        self.base.device().check_accessible()?;
        self.issue_command_write_operation(op_buf)?;
        self.base.issue_command_send_status(DeviceStatus::empty()).map(|_| ())
    }

    pub fn finish_operation(&mut self) -> SdResult {
        self.issue_vendor_command(cmd::GC_ASIC_FINISH_OPERATION)
    }

    /// Cut a running operation short with CMD12.
    pub fn abort_operation(&mut self) -> SdResult {
        self.base.device().check_accessible()?;
        let response = self.base.host_mut().issue_stop_transmission_command()?;
        self.base.device().check_device_status(response)
    }

    pub fn sleep(&mut self) -> SdResult {
        self.issue_vendor_command(cmd::GC_ASIC_SLEEP)
    }

    pub fn update_key(&mut self) -> SdResult {
        self.issue_vendor_command(cmd::GC_ASIC_UPDATE_KEY)
    }

    pub fn speed_mode(&self) -> SdResult<SpeedMode> {
        self.base.device().check_accessible()?;
        Ok(SpeedMode::GcAsicSpeed)
    }

    pub fn signal_removed_event(&self) {
        self.base.device().signal_removed_event();
    }

    pub fn clear_removed_event(&self) {
        self.base.device().clear_removed_event();
    }

    pub fn put_to_sleep(&mut self) {
        let device = self.base.device();
        if !device.is_awake() {
            return;
        }
        if device.is_active() && !device.is_removed() {
            self.base.host_mut().put_to_sleep();
        }
        self.base.device_mut().put_to_sleep();
    }

    pub fn awaken(&mut self) -> SdResult {
        if self.base.device().is_awake() {
            return Ok(());
        }
        self.base.device_mut().awaken();
        let device = self.base.device();
        if device.is_active() && !device.is_removed() {
            self.base.host_mut().awaken()?;
        }
        Ok(())
    }
}

impl<H: HostController> DeviceAccessor for GcAsicDeviceAccessor<H> {
    type Host = H;

    fn base(&self) -> &BaseDeviceAccessor<H> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseDeviceAccessor<H> {
        &mut self.base
    }

    fn on_activate(&mut self) -> SdResult {
        if let Err(err) = self.startup_gc_asic_device() {
            error!("gc: startup failed: {:?}", err);
            self.base.host_mut().shutdown();
            return Err(err);
        }
        info!("gc: active");
        Ok(())
    }

    fn on_read_write(&mut self, sector_index: u32, num_sectors: u32, buf: TransferBuffer<'_>) -> SdResult {
        assert!(num_sectors > 0, "gc: empty transfer");
        assert!(
            buf.len() / SECTOR_SIZE >= num_sectors as usize,
            "gc: buffer holds fewer than {} sectors",
            num_sectors
        );
        let num_transferred = self.base.read_write_single(sector_index, num_sectors, buf)?;
        assert_eq!(num_transferred, num_sectors, "gc: short transfer");
        Ok(())
    }

    fn re_startup(&mut self) -> SdResult {
        self.base.host_mut().shutdown();
        self.startup_gc_asic_device()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::*;
    use super::*;
    use crate::hal::testing;

    struct GcAsic {
        operations: Vec<Vec<u8>>,
        write_fault: Option<SdError>,
        status: u32,
        disk: Disk,
    }

    impl Card for GcAsic {
        fn respond(&mut self, command: &Command, data: Option<&mut TransferData<'_>>) -> SdResult<[u32; 4]> {
            match command.index {
                cmd::GC_ASIC_WRITE_OPERATION => {
                    if let Some(err) = self.write_fault.take() {
                        return Err(err);
                    }
                    match data.map(|x| &x.buffer) {
                        Some(TransferBuffer::Write(buf)) => self.operations.push(buf.to_vec()),
                        _ => panic!("CMD60 without an operation block"),
                    }
                    Ok([STATE_TRAN, 0, 0, 0])
                }
                cmd::SEND_STATUS => Ok([self.status, 0, 0, 0]),
                cmd::READ_SINGLE_BLOCK | cmd::READ_MULTIPLE_BLOCK | cmd::WRITE_BLOCK | cmd::WRITE_MULTIPLE_BLOCK => {
                    self.disk.transfer(command, data)
                }
                _ => Ok([STATE_TRAN, 0, 0, 0]),
            }
        }

        fn stop(&mut self) -> SdResult<u32> {
            self.disk.stop()
        }
    }

    fn accessor() -> GcAsicDeviceAccessor<MockHost<GcAsic>> {
        testing::install();
        let card = GcAsic {
            operations: Vec::new(),
            write_fault: None,
            status: STATE_TRAN,
            disk: Disk {
                byte_addressed: true,
                ..Disk::new(32)
            },
        };
        let mut acc = GcAsicDeviceAccessor::new(MockHost::new(card));
        acc.initialize();
        acc
    }

    fn active() -> GcAsicDeviceAccessor<MockHost<GcAsic>> {
        let mut acc = accessor();
        acc.activate().unwrap();
        acc
    }

    #[test]
    fn startup_is_fixed_and_tuned() {
        let acc = active();
        let host = acc.base.host();
        assert!(host.removed_event.is_some());
        assert_eq!(host.startups, vec![(BusPower::V1_8, BusWidth::EightBit, SpeedMode::GcAsicSpeed)]);
        assert_eq!(host.tunings, vec![(SpeedMode::GcAsicSpeed, 21)]);
        assert!(host.is_power_saving_enable());
        assert_eq!(acc.memory_capacity(), Ok(0));
        assert_eq!(acc.speed_mode(), Ok(SpeedMode::GcAsicSpeed));
        assert_eq!(acc.rca(), Ok(0));
    }

    #[test]
    fn failed_startup_shuts_down() {
        let mut acc = accessor();
        acc.base.host_mut().startup_faults.push_back(SdError::SdmmcCompOpen);
        assert_eq!(acc.activate(), Err(SdError::SdmmcCompOpen));
        assert_eq!(acc.base.host().shutdowns, 1);
        assert_eq!(acc.speed_mode(), Err(SdError::NotActivated));
    }

    #[test]
    #[should_panic]
    fn tuning_is_required() {
        let mut acc = accessor();
        acc.base.host_mut().tuning_supported = false;
        let _ = acc.activate();
    }

    #[test]
    fn operation_block_is_written() {
        let mut acc = active();
        let op: Vec<u8> = (0..GC_ASIC_OPERATION_SIZE as u8 + 8).collect();
        acc.write_operation(&op).unwrap();
        let host = acc.base.host();
        assert_eq!(host.card.operations, vec![op[..GC_ASIC_OPERATION_SIZE].to_vec()]);
        assert_eq!(host.indices(), vec![cmd::GC_ASIC_WRITE_OPERATION, cmd::SEND_STATUS]);
    }

    #[test]
    #[should_panic]
    fn short_operation_block_aborts() {
        let mut acc = active();
        let _ = acc.write_operation(&[0u8; 16]);
    }

    #[test]
    fn stop_status_explains_a_failed_operation() {
        let mut acc = active();
        acc.base.host_mut().card.write_fault = Some(SdError::DataTimeoutError);
        acc.base.host_mut().card.disk.stop_status = status_with(DeviceStatus::CC_ERROR);
        let op = [0u8; GC_ASIC_OPERATION_SIZE];
        assert_eq!(acc.write_operation(&op), Err(SdError::DeviceStatusCcError));
        assert_eq!(
            acc.base.host().indices(),
            vec![cmd::GC_ASIC_WRITE_OPERATION, cmd::STOP_TRANSMISSION, cmd::SEND_STATUS]
        );
    }

    #[test]
    fn status_error_beats_a_transport_error() {
        let mut acc = active();
        acc.base.host_mut().card.write_fault = Some(SdError::DataTimeoutError);
        acc.base.host_mut().card.status = status_with(DeviceStatus::ERROR);
        let op = [0u8; GC_ASIC_OPERATION_SIZE];
        assert_eq!(acc.write_operation(&op), Err(SdError::DeviceStatusError));

        acc.base.host_mut().card.write_fault = Some(SdError::DataTimeoutError);
        acc.base.host_mut().card.status = STATE_TRAN;
        assert_eq!(acc.write_operation(&op), Err(SdError::DataTimeoutError));
    }

    #[test]
    fn removal_during_operation_is_reported() {
        let mut acc = active();
        acc.base.host_mut().card.write_fault = Some(SdError::ResponseTimeoutError);
        let op = [0u8; GC_ASIC_OPERATION_SIZE];
        acc.signal_removed_event();
        assert_eq!(acc.write_operation(&op), Err(SdError::DeviceRemoved));
        acc.clear_removed_event();
        assert_eq!(acc.write_operation(&op), Err(SdError::ResponseTimeoutError));
    }

    #[test]
    fn vendor_commands_are_busy_r1() {
        let mut acc = active();
        acc.finish_operation().unwrap();
        acc.sleep().unwrap();
        acc.update_key().unwrap();
        acc.abort_operation().unwrap();
        assert_eq!(
            acc.base.host().indices(),
            vec![
                cmd::GC_ASIC_FINISH_OPERATION,
                cmd::SEND_STATUS,
                cmd::GC_ASIC_SLEEP,
                cmd::SEND_STATUS,
                cmd::GC_ASIC_UPDATE_KEY,
                cmd::SEND_STATUS,
                cmd::STOP_TRANSMISSION,
            ]
        );
    }

    #[test]
    fn abort_checks_the_stop_response() {
        let mut acc = active();
        acc.base.host_mut().card.disk.stop_status = status_with(DeviceStatus::COM_CRC_ERROR);
        assert_eq!(acc.abort_operation(), Err(SdError::DeviceStatusComCrcError));
    }

    #[test]
    fn reads_use_one_command() {
        let mut acc = active();
        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        acc.read(8, 4, &mut buf).unwrap();
        assert_eq!(acc.base.host().card.disk.transfers, vec![(cmd::READ_MULTIPLE_BLOCK, 8 * SECTOR_SIZE as u32, 4)]);
        assert!(buf[3 * SECTOR_SIZE..].iter().all(|&b| b == 11));
    }

    #[test]
    fn sleep_skips_a_removed_card() {
        let mut acc = active();
        acc.signal_removed_event();
        acc.put_to_sleep();
        assert_eq!(acc.base.host().sleeps, 0);
        acc.clear_removed_event();
        acc.awaken().unwrap();
        assert_eq!(acc.base.host().awakens, 1);

        acc.put_to_sleep();
        assert_eq!(acc.base.host().sleeps, 1);
        acc.base.host_mut().awaken_fault = Some(SdError::SdmmcCompOpen);
        assert_eq!(acc.awaken(), Err(SdError::SdmmcCompOpen));
        assert!(acc.base.device().is_awake());
    }

    #[test]
    fn transfers_are_not_retried() {
        let mut acc = active();
        acc.base.host_mut().card.disk.faults.push_back(SdError::DataCrcError);
        let mut buf = vec![0u8; 2 * SECTOR_SIZE];
        assert_eq!(acc.read(0, 2, &mut buf), Err(SdError::DataCrcError));
        assert_eq!(acc.base.host().card.disk.transfers.len(), 1);
        let (info, _) = acc.get_and_clear_error_info(None);
        assert_eq!(info.num_read_write_failures, 1);
    }

    #[test]
    fn re_startup_repeats_the_fixed_path() {
        let mut acc = active();
        acc.re_startup().unwrap();
        let host = acc.base.host();
        assert_eq!(host.shutdowns, 1);
        assert_eq!(host.startups.len(), 2);
        assert_eq!(host.tunings.len(), 2);
    }
}

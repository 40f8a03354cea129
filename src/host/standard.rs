//! Generic SD Host Standard register protocol: command issue, SDMA transfers,
//! completion waits and error decoding.

use super::regs::*;
use super::*;
use crate::error::SdError;
use crate::hal::*;
use crate::timer::{wait_clocks, ManualTimer};

const CONTROLLER_REACTION_TIMEOUT_MS: u32 = 2000;
const COMMAND_TIMEOUT_MS: u32 = 2000;
const DEFAULT_CHECK_TRANSFER_INTERVAL_MS: u32 = 1500;
const BUSY_TIMEOUT_MS: u32 = 2000;

/// Device clocks to wait around every bus access.
const SETTLE_CLOCKS: u32 = 8;

pub struct SdHostStandardController {
    regs: RegBlock<'static, SdHostRegs>,
    /// Controller interrupt line; without one every wait polls.
    interrupt_event: Option<Arc<dyn Event>>,
    removed_event: Option<Arc<dyn Event>>,
    next_sdma_address: u64,
    check_transfer_interval_ms: u32,
    device_clock_frequency_khz: u32,
    is_power_saving_enable: bool,
    is_device_clock_enable: bool,
    last_response_type: ResponseType,
    last_response: [u32; 4],
    last_stop_transmission_response: u32,
}

impl SdHostStandardController {
    pub fn new(regs: RegBlock<'static, SdHostRegs>) -> Self {
        Self {
            regs,
            interrupt_event: None,
            removed_event: None,
            next_sdma_address: 0,
            check_transfer_interval_ms: DEFAULT_CHECK_TRANSFER_INTERVAL_MS,
            device_clock_frequency_khz: 0,
            is_power_saving_enable: false,
            is_device_clock_enable: false,
            last_response_type: ResponseType::R0,
            last_response: [0; 4],
            last_stop_transmission_response: 0,
        }
    }

    pub fn regs(&self) -> &SdHostRegs {
        &self.regs
    }

    pub fn set_interrupt_event(&mut self, event: Option<Arc<dyn Event>>) {
        self.interrupt_event = event;
    }

    pub fn set_removed_event(&mut self, event: Option<Arc<dyn Event>>) {
        self.removed_event = event;
    }

    /// Read back a register so earlier writes have landed.
    pub fn ensure_control(&self) {
        self.regs.clock_control.read();
    }

    pub fn check_removed(&self) -> SdResult {
        match &self.removed_event {
            Some(event) if event.is_signaled() => Err(SdError::DeviceRemoved),
            _ => Ok(()),
        }
    }

    /// Spin until every bit of `mask` reads as `set`, or fail with
    /// `timeout_ret` after `timeout_ms`.
    fn register_polling<T: RegValue>(
        &self,
        read: impl Fn(&SdHostRegs) -> T,
        mask: T,
        set: bool,
        watch_removal: bool,
        timeout_ms: u32,
        timeout_ret: SdError,
    ) -> SdResult {
        let mut timer = ManualTimer::new(timeout_ms);
        loop {
            if watch_removal {
                self.check_removed()?;
            }
            let value = read(self.regs()) & mask;
            let done = if set { value == mask } else { value == T::ZERO };
            if done {
                return Ok(());
            }
            if !timer.update() {
                return Err(timeout_ret);
            }
            core::hint::spin_loop();
        }
    }

    pub fn enable_internal_clock(&mut self) -> SdResult {
        self.regs
            .clock_control
            .set_bits(ClockControl::INTERNAL_CLOCK_ENABLE.bits());
        self.ensure_control();
        self.register_polling(
            |r| r.clock_control.read(),
            ClockControl::INTERNAL_CLOCK_STABLE.bits(),
            true,
            false,
            CONTROLLER_REACTION_TIMEOUT_MS,
            SdError::InternalClockStableSoftwareTimeout,
        )?;

        // host driven divided clock
        self.regs
            .host_control2
            .clear_bits(HostControl2::PRESET_VALUE_ENABLE.bits());
        self.regs
            .clock_control
            .clear_bits(ClockControl::PROGRAMMABLE_CLOCK.bits());
        self.regs
            .host_control2
            .set_bits(HostControl2::HOST_VERSION_4.bits());

        assert!(
            self.regs
                .capabilities
                .has_bits(CAPABILITIES_64BIT_SYSTEM_ADDRESS_V3),
            "controller lacks 64-bit system addressing"
        );
        self.regs
            .host_control2
            .set_bits(HostControl2::ADDRESSING_64BIT.bits());

        // SDMA
        self.regs
            .host_control
            .clear_bits(HostControl::DMA_SELECT_MASK.bits());
        self.regs.timeout_control.write(DATA_TIMEOUT_COUNTER_MAX);
        Ok(())
    }

    pub fn set_bus_power(&mut self, bus_power: BusPower) {
        let power = &self.regs.power_control;
        match bus_power {
            BusPower::Off => power.clear_bits(PowerControl::BUS_POWER.bits()),
            BusPower::V1_8 => {
                power.write_field(
                    PowerControl::VOLTAGE_MASK.bits(),
                    PowerControl::VOLTAGE_1_8V.bits(),
                );
                power.set_bits(PowerControl::BUS_POWER.bits());
            }
            BusPower::V3_3 => {
                power.write_field(
                    PowerControl::VOLTAGE_MASK.bits(),
                    PowerControl::VOLTAGE_3_3V.bits(),
                );
                power.set_bits(PowerControl::BUS_POWER.bits());
            }
        }
    }

    pub fn bus_power(&self) -> BusPower {
        let power = PowerControl::from_bits_truncate(self.regs.power_control.read());
        if !power.contains(PowerControl::BUS_POWER) {
            return BusPower::Off;
        }
        match power & PowerControl::VOLTAGE_MASK {
            PowerControl::VOLTAGE_1_8V => BusPower::V1_8,
            PowerControl::VOLTAGE_3_3V => BusPower::V3_3,
            other => panic!("bus powered with unknown voltage select {:#x}", other.bits()),
        }
    }

    pub fn set_bus_width(&mut self, bus_width: BusWidth) {
        let host = &self.regs.host_control;
        match bus_width {
            BusWidth::OneBit => {
                host.clear_bits(HostControl::DATA_WIDTH_4BIT.bits());
                host.clear_bits(HostControl::EXTENDED_WIDTH_8BIT.bits());
            }
            BusWidth::FourBit => {
                host.set_bits(HostControl::DATA_WIDTH_4BIT.bits());
                host.clear_bits(HostControl::EXTENDED_WIDTH_8BIT.bits());
            }
            BusWidth::EightBit => host.set_bits(HostControl::EXTENDED_WIDTH_8BIT.bits()),
        }
    }

    pub fn bus_width(&self) -> BusWidth {
        let host = HostControl::from_bits_truncate(self.regs.host_control.read());
        if host.contains(HostControl::EXTENDED_WIDTH_8BIT) {
            BusWidth::EightBit
        } else if host.contains(HostControl::DATA_WIDTH_4BIT) {
            BusWidth::FourBit
        } else {
            BusWidth::OneBit
        }
    }

    pub fn set_device_clock_frequency_khz(&mut self, khz: u32) {
        self.device_clock_frequency_khz = khz;
    }

    pub fn device_clock_frequency_khz(&self) -> u32 {
        self.device_clock_frequency_khz
    }

    pub fn is_sd_clock_enabled(&self) -> bool {
        self.regs
            .clock_control
            .has_bits(ClockControl::SD_CLOCK_ENABLE.bits())
    }

    pub fn set_sd_clock(&self, enable: bool) {
        if enable {
            self.regs
                .clock_control
                .set_bits(ClockControl::SD_CLOCK_ENABLE.bits());
        } else {
            self.regs
                .clock_control
                .clear_bits(ClockControl::SD_CLOCK_ENABLE.bits());
        }
    }

    pub fn set_power_saving(&mut self, enable: bool) {
        self.is_power_saving_enable = enable;
        if enable {
            if self.is_sd_clock_enabled() {
                self.set_sd_clock(false);
            }
        } else if self.is_device_clock_enable && !self.is_sd_clock_enabled() {
            self.set_sd_clock(true);
        }
    }

    pub fn is_power_saving_enable(&self) -> bool {
        self.is_power_saving_enable
    }

    pub fn enable_device_clock(&mut self) {
        if !self.is_power_saving_enable && !self.is_sd_clock_enabled() {
            self.set_sd_clock(true);
        }
        self.is_device_clock_enable = true;
    }

    pub fn disable_device_clock(&mut self) {
        self.is_device_clock_enable = false;
        self.set_sd_clock(false);
    }

    pub fn is_device_clock_enable(&self) -> bool {
        self.is_device_clock_enable
    }

    pub fn change_check_transfer_interval(&mut self, ms: u32) {
        self.check_transfer_interval_ms = ms;
    }

    pub fn set_default_check_transfer_interval(&mut self) {
        self.check_transfer_interval_ms = DEFAULT_CHECK_TRANSFER_INTERVAL_MS;
    }

    pub fn max_transfer_num_blocks(&self) -> u32 {
        BLOCK_COUNT_MAX
    }

    fn enable_interrupt_status(&mut self) {
        self.regs
            .normal_int_enable
            .set_bits(NormalInt::ISSUE_COMMAND.bits());
        self.regs
            .error_int_enable
            .set_bits(ErrorInt::ISSUE_COMMAND.bits());
        self.regs
            .normal_int_enable
            .write(self.regs.normal_int_enable.read());
        self.regs
            .error_int_enable
            .write(self.regs.error_int_enable.read());

        if let Some(event) = &self.interrupt_event {
            event.clear();
            self.regs
                .normal_signal_enable
                .set_bits(NormalInt::ISSUE_COMMAND.bits());
            self.regs
                .error_signal_enable
                .set_bits(ErrorInt::ISSUE_COMMAND.bits());
        }
    }

    fn disable_interrupt_status(&mut self) {
        if self.interrupt_event.is_some() {
            self.regs
                .normal_signal_enable
                .clear_bits(NormalInt::ISSUE_COMMAND.bits());
            self.regs
                .error_signal_enable
                .clear_bits(ErrorInt::ISSUE_COMMAND.bits());
        }
        self.regs
            .normal_int_enable
            .clear_bits(NormalInt::ISSUE_COMMAND.bits());
        self.regs
            .error_int_enable
            .clear_bits(ErrorInt::ISSUE_COMMAND.bits());
    }

    pub fn is_interrupt_driven(&self) -> bool {
        self.interrupt_event.is_some()
    }

    /// Sleep until the controller interrupts, the device is removed, or the
    /// timeout passes.
    pub fn wait_interrupt(&self, timeout_ms: u32) -> SdResult {
        self.ensure_control();
        let interrupt = match &self.interrupt_event {
            Some(event) => event.as_event(),
            None => panic!("interrupt wait without an interrupt event"),
        };
        let timeout_us = u64::from(timeout_ms) * 1000;
        let signaled = match &self.removed_event {
            Some(removed) => platform().timed_wait_any(&[interrupt, removed.as_event()], timeout_us),
            None => platform().timed_wait_any(&[interrupt], timeout_us),
        };
        match signaled {
            Some(0) => Ok(()),
            Some(_) => Err(SdError::DeviceRemoved),
            None => Err(SdError::WaitInterruptSoftwareTimeout),
        }
    }

    pub fn clear_interrupt(&self) {
        self.ensure_control();
        if let Some(event) = &self.interrupt_event {
            event.clear();
        }
    }

    /// Program SDMA for `xfer`, returning the block count handed to hardware.
    fn set_transfer(&mut self, xfer: &TransferData<'_>) -> u32 {
        assert!(xfer.block_size != 0 && xfer.num_blocks != 0);
        assert!(xfer.block_size <= BLOCK_SIZE_MAX);
        let num_blocks = core::cmp::min(xfer.num_blocks, BLOCK_COUNT_MAX);

        let address = virt_to_phys(xfer.buffer.addr()) as u64;
        assert!(
            address % BUFFER_ADDRESS_ALIGNMENT as u64 == 0,
            "dma buffer {:#x} is misaligned",
            address
        );
        self.regs.adma_address.write(address as u32);
        self.regs.upper_adma_address.write((address >> 32) as u32);
        self.next_sdma_address = (address + SDMA_BUFFER_BOUNDARY) & !(SDMA_BUFFER_BOUNDARY - 1);

        self.regs
            .block_size
            .write(BLOCK_SIZE_SDMA_BOUNDARY_512K | xfer.block_size as u16);
        self.regs.block_count.write(num_blocks as u16);

        let mut mode = TransferMode::DMA_ENABLE;
        if xfer.is_multi_block {
            mode |= TransferMode::BLOCK_COUNT_ENABLE | TransferMode::MULTI_BLOCK;
        }
        if xfer.direction() == TransferDirection::ReadFromDevice {
            mode |= TransferMode::DIRECTION_READ;
        }
        if xfer.is_stop_transmission_auto {
            mode |= TransferMode::AUTO_CMD12;
        }
        self.regs.transfer_mode.write(mode.bits());
        num_blocks
    }

    /// Tuning reads one block whose size depends on the bus width.
    pub fn set_transfer_for_tuning(&mut self) {
        let block_size: u16 = match self.bus_width() {
            BusWidth::FourBit => 64,
            BusWidth::EightBit => 128,
            BusWidth::OneBit => panic!("tuning on a 1-bit bus"),
        };
        self.regs.block_size.write(block_size);
        self.regs.block_count.write(1);
        self.regs
            .transfer_mode
            .write(TransferMode::DIRECTION_READ.bits());
    }

    fn set_command(&mut self, command: &Command, has_xfer_data: bool) {
        let mut value = match command.response_type {
            ResponseType::R0 => CommandReg::RESPONSE_NONE,
            ResponseType::R1 | ResponseType::R6 | ResponseType::R7 => {
                let length = if command.is_busy {
                    CommandReg::RESPONSE_48_BUSY
                } else {
                    CommandReg::RESPONSE_48
                };
                length | CommandReg::CRC_CHECK | CommandReg::INDEX_CHECK
            }
            ResponseType::R2 => CommandReg::RESPONSE_136 | CommandReg::CRC_CHECK,
            ResponseType::R3 => CommandReg::RESPONSE_48,
        };
        if has_xfer_data {
            value |= CommandReg::DATA_PRESENT;
        }
        assert!(command.index <= COMMAND_INDEX_MAX);
        let raw = value.bits() | ((command.index as u16) << COMMAND_INDEX_SHIFT);

        self.regs.argument.write(command.argument);
        self.regs.command.write(raw);
    }

    pub fn set_command_for_tuning(&mut self, command_index: u32) {
        let command = Command::new(command_index, 0, ResponseType::R1, false);
        self.set_command(&command, true);
    }

    pub fn reset_cmd_dat_line(&mut self) -> SdResult {
        self.regs
            .software_reset
            .set_bits((SoftwareReset::RESET_CMD | SoftwareReset::RESET_DAT).bits());
        self.ensure_control();
        self.register_polling(
            |r| r.software_reset.read(),
            (SoftwareReset::RESET_CMD | SoftwareReset::RESET_DAT).bits(),
            false,
            true,
            CONTROLLER_REACTION_TIMEOUT_MS,
            SdError::AbortTransactionSoftwareTimeout,
        )
    }

    pub fn abort_transaction(&mut self) -> SdResult {
        self.reset_cmd_dat_line()
    }

    /// Abort after a failed wait. The caller reports `err`; a failing
    /// reset is only logged.
    fn abort_after(&mut self, err: SdError) -> SdError {
        if let Err(abort_err) = self.abort_transaction() {
            debug!("sdhc: abort after {:?} failed: {:?}", err, abort_err);
        }
        err
    }

    pub fn wait_while_command_inhibit(&mut self, has_dat: bool) -> SdResult {
        self.ensure_control();
        let res = self.register_polling(
            |r| r.present_state.read(),
            PresentState::COMMAND_INHIBIT_CMD.bits(),
            false,
            true,
            CONTROLLER_REACTION_TIMEOUT_MS,
            SdError::CommandInhibitCmdSoftwareTimeout,
        );
        if let Err(SdError::CommandInhibitCmdSoftwareTimeout) = res {
            return Err(self.abort_after(SdError::CommandInhibitCmdSoftwareTimeout));
        }
        res?;

        if has_dat {
            let res = self.register_polling(
                |r| r.present_state.read(),
                PresentState::COMMAND_INHIBIT_DAT.bits(),
                false,
                true,
                CONTROLLER_REACTION_TIMEOUT_MS,
                SdError::CommandInhibitDatSoftwareTimeout,
            );
            if let Err(SdError::CommandInhibitDatSoftwareTimeout) = res {
                return Err(self.abort_after(SdError::CommandInhibitDatSoftwareTimeout));
            }
            res?;
        }
        Ok(())
    }

    /// Consume the waited-for bits of the normal status, or decode the error
    /// status. Returns the normal status that was read.
    fn check_and_clear_interrupt_status(&mut self, wait_mask: NormalInt) -> SdResult<NormalInt> {
        let normal = NormalInt::from_bits_truncate(self.regs.normal_int_status.read());
        let error = ErrorInt::from_bits_truncate(self.regs.error_int_status.read());
        let auto_cmd = AutoCmdError::from_bits_truncate(self.regs.acmd12_err.read());

        if !normal.contains(NormalInt::ERROR_INTERRUPT) {
            let masked = normal & wait_mask;
            if masked.is_empty() {
                return Err(SdError::NoWaitedInterrupt);
            }
            self.regs.normal_int_status.write(masked.bits());
            return Ok(normal);
        }

        self.regs.error_int_status.write(error.bits());
        debug!("sdhc: error interrupt {:?} auto cmd {:?}", error, auto_cmd);

        let decode = [
            (ErrorInt::COMMAND_INDEX, SdError::ResponseIndexError),
            (ErrorInt::COMMAND_END_BIT, SdError::ResponseEndBitError),
            (ErrorInt::COMMAND_CRC, SdError::ResponseCrcError),
            (ErrorInt::COMMAND_TIMEOUT, SdError::ResponseTimeoutError),
            (ErrorInt::DATA_END_BIT, SdError::DataEndBitError),
            (ErrorInt::DATA_CRC, SdError::DataCrcError),
            (ErrorInt::DATA_TIMEOUT, SdError::DataTimeoutError),
        ];
        if let Some(&(_, err)) = decode.iter().find(|(bit, _)| error.contains(*bit)) {
            return Err(err);
        }

        if error.contains(ErrorInt::AUTO_CMD) {
            let decode = [
                (AutoCmdError::INDEX, SdError::AutoCommandResponseIndexError),
                (AutoCmdError::END_BIT, SdError::AutoCommandResponseEndBitError),
                (AutoCmdError::CRC, SdError::AutoCommandResponseCrcError),
                (AutoCmdError::TIMEOUT, SdError::AutoCommandResponseTimeoutError),
            ];
            return Err(decode
                .iter()
                .find(|(bit, _)| auto_cmd.contains(*bit))
                .map(|&(_, err)| err)
                .unwrap_or(SdError::SdHostStandardUnknownAutoCmdError));
        }
        Err(SdError::SdHostStandardUnknownError)
    }

    fn wait_command_complete(&mut self) -> SdResult {
        if self.is_interrupt_driven() {
            return match self.wait_interrupt(COMMAND_TIMEOUT_MS) {
                Ok(()) => {
                    let res = self.check_and_clear_interrupt_status(NormalInt::COMMAND_COMPLETE);
                    self.clear_interrupt();
                    res.map(|_| ()).map_err(|err| self.abort_after(err))
                }
                Err(SdError::DeviceRemoved) => Err(SdError::DeviceRemoved),
                Err(_) => Err(self.abort_after(SdError::CommandCompleteSoftwareTimeout)),
            };
        }

        self.ensure_control();
        let mut timer = ManualTimer::new(COMMAND_TIMEOUT_MS);
        loop {
            match self.check_and_clear_interrupt_status(NormalInt::COMMAND_COMPLETE) {
                Ok(_) => return Ok(()),
                Err(SdError::NoWaitedInterrupt) => {
                    if !timer.update() {
                        return Err(self.abort_after(SdError::CommandCompleteSoftwareTimeout));
                    }
                }
                Err(err) => return Err(self.abort_after(err)),
            }
        }
    }

    /// Re-arm SDMA at the next boundary after a DMA interrupt.
    fn advance_sdma_address(&mut self) {
        self.regs.adma_address.write(self.next_sdma_address as u32);
        self.regs
            .upper_adma_address
            .write((self.next_sdma_address >> 32) as u32);
        self.next_sdma_address += SDMA_BUFFER_BOUNDARY;
    }

    fn wait_transfer_complete(&mut self) -> SdResult {
        let wait_mask = NormalInt::TRANSFER_COMPLETE | NormalInt::DMA_INTERRUPT;
        loop {
            let last_block_count = self.regs.block_count.read();

            if self.is_interrupt_driven() {
                match self.wait_interrupt(self.check_transfer_interval_ms) {
                    Ok(()) => {
                        let res = self.check_and_clear_interrupt_status(wait_mask);
                        self.clear_interrupt();
                        match res {
                            Ok(status) if status.contains(NormalInt::TRANSFER_COMPLETE) => return Ok(()),
                            Ok(status) => {
                                if status.contains(NormalInt::DMA_INTERRUPT) {
                                    self.advance_sdma_address();
                                }
                            }
                            Err(SdError::NoWaitedInterrupt) => {}
                            Err(err) => return Err(self.abort_after(err)),
                        }
                    }
                    Err(SdError::DeviceRemoved) => return Err(SdError::DeviceRemoved),
                    Err(_) => {
                        if last_block_count == self.regs.block_count.read() {
                            return Err(self.abort_after(SdError::TransferCompleteSoftwareTimeout));
                        }
                    }
                }
                continue;
            }

            let mut timer = ManualTimer::new(self.check_transfer_interval_ms);
            loop {
                match self.check_and_clear_interrupt_status(wait_mask) {
                    Ok(status) => {
                        if status.contains(NormalInt::TRANSFER_COMPLETE) {
                            return Ok(());
                        }
                        if status.contains(NormalInt::DMA_INTERRUPT) {
                            self.advance_sdma_address();
                        }
                    }
                    Err(SdError::NoWaitedInterrupt) => {
                        if !timer.update() {
                            // stalled for a whole interval
                            if last_block_count == self.regs.block_count.read() {
                                return Err(self.abort_after(SdError::TransferCompleteSoftwareTimeout));
                            }
                            break;
                        }
                    }
                    Err(err) => return Err(self.abort_after(err)),
                }
            }
        }
    }

    fn wait_while_busy(&mut self) -> SdResult {
        self.ensure_control();
        let res = self.register_polling(
            |r| r.present_state.read(),
            PresentState::DAT0_LINE_LEVEL.bits(),
            true,
            true,
            BUSY_TIMEOUT_MS,
            SdError::BusySoftwareTimeout,
        );
        if let Err(SdError::BusySoftwareTimeout) = res {
            return Err(self.abort_after(SdError::BusySoftwareTimeout));
        }
        res
    }

    fn read_response(&self, response_type: ResponseType) -> [u32; 4] {
        let mut response = [0u32; 4];
        match response_type {
            ResponseType::R1 | ResponseType::R3 | ResponseType::R6 | ResponseType::R7 => {
                response[0] = self.regs.response[0].read();
            }
            ResponseType::R2 => {
                for (out, reg) in response.iter_mut().zip(self.regs.response.iter()) {
                    *out = reg.read();
                }
            }
            ResponseType::R0 => panic!("R0 carries no response"),
        }
        response
    }

    fn issue_command_with_device_clock(
        &mut self,
        command: &Command,
        mut xfer: Option<&mut TransferData<'_>>,
    ) -> SdResult<u32> {
        self.wait_while_command_inhibit(xfer.is_some() || command.is_busy)?;

        let mut num_transferred_blocks = 0;
        if let Some(data) = xfer.as_deref() {
            num_transferred_blocks = self.set_transfer(data);
            flush_data_cache(
                data.buffer.addr(),
                (data.block_size * num_transferred_blocks) as usize,
            );
        }

        self.enable_interrupt_status();
        let res = self.issue_and_wait(command, xfer.is_some());
        self.disable_interrupt_status();
        res?;

        if let Some(data) = xfer.as_deref_mut() {
            if data.direction() == TransferDirection::ReadFromDevice {
                invalidate_data_cache(
                    data.buffer.addr(),
                    (data.block_size * num_transferred_blocks) as usize,
                );
            }
            self.last_stop_transmission_response = self.regs.response[3].read();
        }

        if command.is_busy || xfer.is_some() {
            self.wait_while_busy()?;
        }
        Ok(num_transferred_blocks)
    }

    fn issue_and_wait(&mut self, command: &Command, has_xfer_data: bool) -> SdResult {
        self.set_command(command, has_xfer_data);
        self.wait_command_complete()?;
        if command.response_type != ResponseType::R0 {
            self.last_response_type = command.response_type;
            self.last_response = self.read_response(command.response_type);
        }
        if has_xfer_data {
            self.wait_transfer_complete()?;
        }
        Ok(())
    }

    fn issue_stop_transmission_with_device_clock(&mut self) -> SdResult<u32> {
        self.wait_while_command_inhibit(false)?;

        let command = Command::new(cmd::STOP_TRANSMISSION, 0, ResponseType::R1, true);
        self.enable_interrupt_status();
        self.set_command(&command, false);
        let res = self.wait_command_complete();
        self.disable_interrupt_status();
        res?;

        let response = self.read_response(ResponseType::R1)[0];
        self.wait_while_busy()?;
        Ok(response)
    }

    /// Run `f` with the SD clock forced on, then restore it; every access is
    /// followed by a settle period.
    fn with_device_clock<R>(&mut self, f: impl FnOnce(&mut Self) -> SdResult<R>) -> SdResult<R> {
        assert!(self.is_device_clock_enable, "device clock is not enabled");
        let clock_disabled = !self.is_sd_clock_enabled();
        if clock_disabled {
            self.set_sd_clock(true);
            self.ensure_control();
            wait_clocks(SETTLE_CLOCKS, self.device_clock_frequency_khz);
        }
        let res = f(self);
        wait_clocks(SETTLE_CLOCKS, self.device_clock_frequency_khz);
        if clock_disabled {
            self.set_sd_clock(false);
        }
        res
    }

    pub fn issue_command(&mut self, command: &Command, xfer: Option<&mut TransferData<'_>>) -> SdResult<u32> {
        self.with_device_clock(|host| host.issue_command_with_device_clock(command, xfer))
    }

    pub fn issue_stop_transmission_command(&mut self) -> SdResult<u32> {
        self.with_device_clock(|host| host.issue_stop_transmission_with_device_clock())
    }

    pub fn last_response(&self, response_type: ResponseType) -> [u32; 4] {
        assert_eq!(
            response_type, self.last_response_type,
            "asked for a response of another type"
        );
        match response_type {
            ResponseType::R2 => self.last_response,
            ResponseType::R0 => panic!("R0 carries no response"),
            _ => [self.last_response[0], 0, 0, 0],
        }
    }

    pub fn last_stop_transmission_response(&self) -> u32 {
        self.last_stop_transmission_response
    }
}

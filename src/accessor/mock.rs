//! Scripted host controller for accessor tests. Commands are answered by a
//! [`Card`]; the host itself only tracks bus state and records traffic.

use crate::device::DeviceStatus;
use crate::error::{SdError, SdResult};
use crate::hal::Event;
use crate::host::*;
use alloc::sync::Arc;
use std::collections::VecDeque;

pub const STATE_TRAN: u32 = 4 << 9;

/// Device side of the bus.
pub trait Card: Send {
    /// Answer one command. R2 answers fill all four words; the others only
    /// the first.
    fn respond(&mut self, command: &Command, data: Option<&mut TransferData<'_>>) -> SdResult<[u32; 4]>;

    /// Answer CMD12, issued either explicitly or by the controller.
    fn stop(&mut self) -> SdResult<u32> {
        Ok(STATE_TRAN)
    }
}

pub struct MockHost<C: Card> {
    pub card: C,
    pub issued: Vec<(u32, u32)>,
    pub startups: Vec<(BusPower, BusWidth, SpeedMode)>,
    pub startup_faults: VecDeque<SdError>,
    pub speed_faults: VecDeque<(SpeedMode, SdError)>,
    pub tunings: Vec<(SpeedMode, u32)>,
    pub tuning_supported: bool,
    pub supported_powers: Vec<BusPower>,
    pub supported_widths: Vec<BusWidth>,
    pub shutdowns: u32,
    pub sleeps: u32,
    pub awakens: u32,
    pub awaken_fault: Option<SdError>,
    pub sdr12_switches: u32,
    pub hs400_saves: u32,
    pub internal_status: SdResult,
    pub max_blocks: u32,
    pub removed_event: Option<Arc<dyn Event>>,
    pub initialized: bool,
    bus_power: BusPower,
    bus_width: BusWidth,
    speed_mode: SpeedMode,
    power_saving: bool,
    last_response_type: ResponseType,
    last_response: [u32; 4],
    last_stop_response: u32,
}

impl<C: Card> MockHost<C> {
    pub fn new(card: C) -> Self {
        Self {
            card,
            issued: Vec::new(),
            startups: Vec::new(),
            startup_faults: VecDeque::new(),
            speed_faults: VecDeque::new(),
            tunings: Vec::new(),
            tuning_supported: true,
            supported_powers: vec![BusPower::V1_8, BusPower::V3_3],
            supported_widths: vec![BusWidth::OneBit, BusWidth::FourBit, BusWidth::EightBit],
            shutdowns: 0,
            sleeps: 0,
            awakens: 0,
            awaken_fault: None,
            sdr12_switches: 0,
            hs400_saves: 0,
            internal_status: Ok(()),
            max_blocks: 0xFFFF,
            removed_event: None,
            initialized: false,
            bus_power: BusPower::Off,
            bus_width: BusWidth::OneBit,
            speed_mode: SpeedMode::MmcIdentification,
            power_saving: false,
            last_response_type: ResponseType::R0,
            last_response: [0; 4],
            last_stop_response: 0,
        }
    }

    /// Indices of every command issued so far.
    pub fn indices(&self) -> Vec<u32> {
        self.issued.iter().map(|&(index, _)| index).collect()
    }

    pub fn count(&self, index: u32) -> usize {
        self.issued.iter().filter(|&&(i, _)| i == index).count()
    }
}

impl<C: Card> HostController for MockHost<C> {
    fn initialize(&mut self) {
        self.initialized = true;
    }

    fn finalize(&mut self) {
        self.initialized = false;
    }

    fn set_removed_event(&mut self, event: Option<Arc<dyn Event>>) {
        self.removed_event = event;
    }

    fn startup(&mut self, bus_power: BusPower, bus_width: BusWidth, speed_mode: SpeedMode, power_saving_enable: bool) -> SdResult {
        self.startups.push((bus_power, bus_width, speed_mode));
        if let Some(err) = self.startup_faults.pop_front() {
            return Err(err);
        }
        self.bus_power = bus_power;
        self.bus_width = bus_width;
        self.speed_mode = speed_mode;
        self.power_saving = power_saving_enable;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
        self.bus_power = BusPower::Off;
    }

    fn put_to_sleep(&mut self) {
        self.sleeps += 1;
    }

    fn awaken(&mut self) -> SdResult {
        self.awakens += 1;
        match self.awaken_fault.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn switch_to_sdr12(&mut self) -> SdResult {
        self.sdr12_switches += 1;
        self.bus_power = BusPower::V1_8;
        self.speed_mode = SpeedMode::SdSdr12;
        Ok(())
    }

    fn is_supported_bus_power(&self, bus_power: BusPower) -> bool {
        self.supported_powers.contains(&bus_power)
    }

    fn bus_power(&self) -> BusPower {
        self.bus_power
    }

    fn is_supported_bus_width(&self, bus_width: BusWidth) -> bool {
        self.supported_widths.contains(&bus_width)
    }

    fn set_bus_width(&mut self, bus_width: BusWidth) {
        self.bus_width = bus_width;
    }

    fn bus_width(&self) -> BusWidth {
        self.bus_width
    }

    fn set_speed_mode(&mut self, speed_mode: SpeedMode) -> SdResult {
        if let Some(pos) = self.speed_faults.iter().position(|&(mode, _)| mode == speed_mode) {
            if let Some((_, err)) = self.speed_faults.remove(pos) {
                return Err(err);
            }
        }
        self.speed_mode = speed_mode;
        Ok(())
    }

    fn speed_mode(&self) -> SpeedMode {
        self.speed_mode
    }

    fn device_clock_frequency_khz(&self) -> u32 {
        400
    }

    fn set_power_saving(&mut self, enable: bool) {
        self.power_saving = enable;
    }

    fn is_power_saving_enable(&self) -> bool {
        self.power_saving
    }

    fn enable_device_clock(&mut self) {}

    fn disable_device_clock(&mut self) {}

    fn change_check_transfer_interval(&mut self, _ms: u32) {}

    fn set_default_check_transfer_interval(&mut self) {}

    fn max_transfer_num_blocks(&self) -> u32 {
        self.max_blocks
    }

    fn issue_command(&mut self, command: &Command, xfer: Option<&mut TransferData<'_>>) -> SdResult<u32> {
        self.issued.push((command.index, command.argument));
        let (num_blocks, auto_stop) = match &xfer {
            Some(x) => (x.num_blocks, x.is_stop_transmission_auto),
            None => (0, false),
        };
        let response = self.card.respond(command, xfer)?;
        self.last_response_type = command.response_type;
        self.last_response = response;
        if auto_stop {
            self.last_stop_response = self.card.stop()?;
        }
        Ok(num_blocks)
    }

    fn issue_stop_transmission_command(&mut self) -> SdResult<u32> {
        self.issued.push((cmd::STOP_TRANSMISSION, 0));
        self.card.stop()
    }

    fn last_response(&self, response_type: ResponseType) -> [u32; 4] {
        assert_eq!(response_type, self.last_response_type);
        self.last_response
    }

    fn last_stop_transmission_response(&self) -> u32 {
        self.last_stop_response
    }

    fn is_supported_tuning(&self) -> bool {
        self.tuning_supported
    }

    fn tuning(&mut self, speed_mode: SpeedMode, command_index: u32) -> SdResult {
        self.tunings.push((speed_mode, command_index));
        Ok(())
    }

    fn save_tuning_status_for_hs400(&mut self) {
        self.hs400_saves += 1;
    }

    fn internal_status(&self) -> SdResult {
        self.internal_status
    }
}

/// Block device answering the data-phase commands, with a queue of
/// failures to inject into the next transfers.
pub struct Disk {
    pub data: Vec<u8>,
    pub faults: VecDeque<SdError>,
    pub status: u32,
    pub stop_status: u32,
    pub transfers: Vec<(u32, u32, u32)>,
    pub removed_on_fault: Option<Arc<dyn Event>>,
    /// Commands carry byte offsets instead of sector numbers.
    pub byte_addressed: bool,
}

impl Disk {
    pub fn new(num_sectors: usize) -> Self {
        let data = (0..num_sectors * SECTOR_SIZE).map(|i| (i / SECTOR_SIZE) as u8).collect();
        Self {
            data,
            faults: VecDeque::new(),
            status: STATE_TRAN,
            stop_status: STATE_TRAN,
            transfers: Vec::new(),
            removed_on_fault: None,
            byte_addressed: false,
        }
    }

    pub fn num_sectors(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }

    /// Move data for a read/write command addressed by sector.
    pub fn transfer(&mut self, command: &Command, data: Option<&mut TransferData<'_>>) -> SdResult<[u32; 4]> {
        let xfer = match data {
            Some(x) => x,
            None => panic!("CMD{} without data", command.index),
        };
        self.transfers.push((command.index, command.argument, xfer.num_blocks));
        if let Some(err) = self.faults.pop_front() {
            if let Some(event) = &self.removed_on_fault {
                event.signal();
            }
            return Err(err);
        }
        let start = if self.byte_addressed {
            command.argument as usize
        } else {
            command.argument as usize * SECTOR_SIZE
        };
        let len = xfer.num_blocks as usize * SECTOR_SIZE;
        match &mut xfer.buffer {
            TransferBuffer::Read(buf) => buf[..len].copy_from_slice(&self.data[start..start + len]),
            TransferBuffer::Write(buf) => self.data[start..start + len].copy_from_slice(&buf[..len]),
        }
        Ok([self.status, 0, 0, 0])
    }
}

impl Card for Disk {
    fn respond(&mut self, command: &Command, data: Option<&mut TransferData<'_>>) -> SdResult<[u32; 4]> {
        match command.index {
            cmd::READ_SINGLE_BLOCK | cmd::READ_MULTIPLE_BLOCK | cmd::WRITE_BLOCK | cmd::WRITE_MULTIPLE_BLOCK => {
                self.transfer(command, data)
            }
            cmd::SEND_STATUS => Ok([self.status, 0, 0, 0]),
            _ => Ok([STATE_TRAN, 0, 0, 0]),
        }
    }

    fn stop(&mut self) -> SdResult<u32> {
        Ok(self.stop_status)
    }
}

pub fn status_with(bits: DeviceStatus) -> u32 {
    STATE_TRAN | bits.bits()
}

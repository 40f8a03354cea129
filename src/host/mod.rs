//! Host controller layer: the SD host standard protocol engine, the Tegra
//! board controller built on it, and per-port power sequencing.

use crate::error::SdResult;
use crate::hal::Event;
use alloc::sync::Arc;

mod power;
pub mod regs;
mod sdmmc;
mod standard;

pub use power::{PcvPowerController, PowerControlStrategy, RegisterPowerController};
pub use sdmmc::{SdmmcController, SdmmcPort};
pub use standard::SdHostStandardController;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BusPower {
    Off,
    V1_8,
    V3_3,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BusWidth {
    OneBit,
    FourBit,
    EightBit,
}

impl BusWidth {
    /// Width as printed in startup logs.
    pub fn bits(self) -> u32 {
        match self {
            BusWidth::OneBit => 1,
            BusWidth::FourBit => 4,
            BusWidth::EightBit => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SpeedMode {
    MmcIdentification,
    MmcLegacySpeed,
    MmcHighSpeed,
    MmcHs200,
    MmcHs400,
    SdIdentification,
    SdDefaultSpeed,
    SdHighSpeed,
    SdSdr12,
    SdSdr25,
    SdSdr50,
    SdSdr104,
    SdDdr50,
    GcAsicFpgaSpeed,
    GcAsicSpeed,
}

impl SpeedMode {
    /// Short tag used by the startup log lines.
    pub fn log_name(self) -> &'static str {
        use self::SpeedMode::*;
        match self {
            MmcIdentification => "MmcId",
            MmcLegacySpeed => "MmcLeg",
            MmcHighSpeed => "MmcHs",
            MmcHs200 => "Hs200",
            MmcHs400 => "Hs400",
            SdIdentification => "SdId",
            SdDefaultSpeed => "SdDef",
            SdHighSpeed => "SdHs",
            SdSdr12 => "Sdr12",
            SdSdr25 => "Sdr25",
            SdSdr50 => "Sdr50",
            SdSdr104 => "Sdr104",
            SdDdr50 => "Ddr50",
            GcAsicFpgaSpeed => "GcFpga",
            GcAsicSpeed => "GcAsic",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponseType {
    R0,
    R1,
    R2,
    R3,
    R6,
    R7,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferDirection {
    ReadFromDevice,
    WriteToDevice,
}

/// Command indices used across the stack.
pub mod cmd {
    pub const GO_IDLE_STATE: u32 = 0;
    pub const SEND_OP_COND: u32 = 1;
    pub const ALL_SEND_CID: u32 = 2;
    pub const SET_RELATIVE_ADDR: u32 = 3;
    pub const SEND_RELATIVE_ADDR: u32 = 3;
    pub const SWITCH: u32 = 6;
    pub const SELECT_CARD: u32 = 7;
    pub const SEND_IF_COND: u32 = 8;
    pub const SEND_EXT_CSD: u32 = 8;
    pub const SEND_CSD: u32 = 9;
    pub const VOLTAGE_SWITCH: u32 = 11;
    pub const STOP_TRANSMISSION: u32 = 12;
    pub const SEND_STATUS: u32 = 13;
    pub const SET_BLOCKLEN: u32 = 16;
    pub const READ_SINGLE_BLOCK: u32 = 17;
    pub const READ_MULTIPLE_BLOCK: u32 = 18;
    pub const SEND_TUNING_BLOCK: u32 = 19;
    pub const SEND_TUNING_BLOCK_HS200: u32 = 21;
    pub const WRITE_BLOCK: u32 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u32 = 25;
    pub const ERASE_GROUP_START: u32 = 35;
    pub const ERASE_GROUP_END: u32 = 36;
    pub const ERASE: u32 = 38;
    pub const APP_CMD: u32 = 55;
    pub const GC_ASIC_WRITE_OPERATION: u32 = 60;
    pub const GC_ASIC_FINISH_OPERATION: u32 = 61;
    pub const GC_ASIC_SLEEP: u32 = 62;
    pub const GC_ASIC_UPDATE_KEY: u32 = 63;

    // application commands, preceded by APP_CMD
    pub const APP_SET_BUS_WIDTH: u32 = 6;
    pub const APP_SD_STATUS: u32 = 13;
    pub const APP_SD_SEND_OP_COND: u32 = 41;
    pub const APP_SET_CLR_CARD_DETECT: u32 = 42;
    pub const APP_SEND_SCR: u32 = 51;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Command {
    pub index: u32,
    pub argument: u32,
    pub response_type: ResponseType,
    pub is_busy: bool,
}

impl Command {
    pub const fn new(index: u32, argument: u32, response_type: ResponseType, is_busy: bool) -> Self {
        Self {
            index,
            argument,
            response_type,
            is_busy,
        }
    }
}

/// Memory the controller moves data to or from.
#[derive(Debug)]
pub enum TransferBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<'a> TransferBuffer<'a> {
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Read(buf) => buf.len(),
            TransferBuffer::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_read(&self) -> bool {
        matches!(self, TransferBuffer::Read(_))
    }

    pub fn direction(&self) -> TransferDirection {
        if self.is_read() {
            TransferDirection::ReadFromDevice
        } else {
            TransferDirection::WriteToDevice
        }
    }

    pub fn addr(&self) -> usize {
        match self {
            TransferBuffer::Read(buf) => buf.as_ptr() as usize,
            TransferBuffer::Write(buf) => buf.as_ptr() as usize,
        }
    }

    /// Reborrow `len` bytes starting at `offset`.
    pub fn slice(&mut self, offset: usize, len: usize) -> TransferBuffer<'_> {
        match self {
            TransferBuffer::Read(buf) => TransferBuffer::Read(&mut buf[offset..offset + len]),
            TransferBuffer::Write(buf) => TransferBuffer::Write(&buf[offset..offset + len]),
        }
    }
}

/// One data phase. A single block never uses the multi-block machinery; more
/// than one block always does, with CMD12 issued automatically.
#[derive(Debug)]
pub struct TransferData<'a> {
    pub buffer: TransferBuffer<'a>,
    pub block_size: u32,
    pub num_blocks: u32,
    pub is_multi_block: bool,
    pub is_stop_transmission_auto: bool,
}

impl<'a> TransferData<'a> {
    pub fn new(buffer: TransferBuffer<'a>, block_size: u32, num_blocks: u32) -> Self {
        assert!(block_size != 0 && num_blocks != 0);
        assert!(buffer.len() >= (block_size as usize) * (num_blocks as usize));
        let multi = num_blocks > 1;
        Self {
            buffer,
            block_size,
            num_blocks,
            is_multi_block: multi,
            is_stop_transmission_auto: multi,
        }
    }

    pub fn read(buf: &'a mut [u8], block_size: u32, num_blocks: u32) -> Self {
        Self::new(TransferBuffer::Read(buf), block_size, num_blocks)
    }

    pub fn write(buf: &'a [u8], block_size: u32, num_blocks: u32) -> Self {
        Self::new(TransferBuffer::Write(buf), block_size, num_blocks)
    }

    pub fn direction(&self) -> TransferDirection {
        self.buffer.direction()
    }
}

/// What the device accessors need from a host controller.
pub trait HostController: Send {
    fn initialize(&mut self);
    fn finalize(&mut self);

    /// Event that aborts hardware waits when the device goes away.
    fn set_removed_event(&mut self, event: Option<Arc<dyn Event>>);

    fn startup(
        &mut self,
        bus_power: BusPower,
        bus_width: BusWidth,
        speed_mode: SpeedMode,
        power_saving_enable: bool,
    ) -> SdResult;
    fn shutdown(&mut self);
    fn put_to_sleep(&mut self);
    fn awaken(&mut self) -> SdResult;

    fn switch_to_sdr12(&mut self) -> SdResult;

    fn is_supported_bus_power(&self, bus_power: BusPower) -> bool;
    fn bus_power(&self) -> BusPower;

    fn is_supported_bus_width(&self, bus_width: BusWidth) -> bool;
    fn set_bus_width(&mut self, bus_width: BusWidth);
    fn bus_width(&self) -> BusWidth;

    fn set_speed_mode(&mut self, speed_mode: SpeedMode) -> SdResult;
    fn speed_mode(&self) -> SpeedMode;

    fn device_clock_frequency_khz(&self) -> u32;

    fn set_power_saving(&mut self, enable: bool);
    fn is_power_saving_enable(&self) -> bool;

    fn enable_device_clock(&mut self);
    fn disable_device_clock(&mut self);

    fn change_check_transfer_interval(&mut self, ms: u32);
    fn set_default_check_transfer_interval(&mut self);

    fn max_transfer_num_blocks(&self) -> u32;

    /// Issue one command, returning how many blocks were moved.
    fn issue_command(&mut self, command: &Command, xfer: Option<&mut TransferData<'_>>) -> SdResult<u32>;
    /// CMD12, returning its R1.
    fn issue_stop_transmission_command(&mut self) -> SdResult<u32>;

    fn last_response(&self, response_type: ResponseType) -> [u32; 4];
    fn last_stop_transmission_response(&self) -> u32;

    fn is_supported_tuning(&self) -> bool;
    fn tuning(&mut self, speed_mode: SpeedMode, command_index: u32) -> SdResult;
    fn save_tuning_status_for_hs400(&mut self);

    /// Result of the last drive-strength calibration.
    fn internal_status(&self) -> SdResult;
}

use crate::hal::{Reg, RoReg};
use static_assertions::const_assert_eq;

/* #REF: SD Host Controller Simplified Specification v4.20, section 2.2 */

#[repr(C)]
pub struct SdHostRegs {
    pub dma_address: Reg<u32>,
    pub block_size: Reg<u16>,
    pub block_count: Reg<u16>,
    pub argument: Reg<u32>,
    pub transfer_mode: Reg<u16>,
    pub command: Reg<u16>,
    pub response: [RoReg<u32>; 4],
    pub buffer: Reg<u32>,
    pub present_state: RoReg<u32>,
    pub host_control: Reg<u8>,
    pub power_control: Reg<u8>,
    pub block_gap_control: Reg<u8>,
    pub wakeup_control: Reg<u8>,
    pub clock_control: Reg<u16>,
    pub timeout_control: Reg<u8>,
    pub software_reset: Reg<u8>,
    pub normal_int_status: Reg<u16>,
    pub error_int_status: Reg<u16>,
    pub normal_int_enable: Reg<u16>,
    pub error_int_enable: Reg<u16>,
    pub normal_signal_enable: Reg<u16>,
    pub error_signal_enable: Reg<u16>,
    pub acmd12_err: RoReg<u16>,
    pub host_control2: Reg<u16>,
    pub capabilities: RoReg<u32>,
    pub capabilities_1: RoReg<u32>,
    pub max_current: RoReg<u32>,
    _res0: u32,
    pub set_acmd12_error: Reg<u16>,
    pub set_int_error: Reg<u16>,
    pub adma_error: Reg<u8>,
    _res1: [u8; 3],
    pub adma_address: Reg<u32>,
    pub upper_adma_address: Reg<u32>,
    pub preset: [Reg<u16>; 8],
    _res2: [u32; 35],
    pub slot_int_status: RoReg<u16>,
    pub host_version: RoReg<u16>,
}

/* #REF: Tegra X1 TRM, SDMMC vendor registers */

#[repr(C)]
pub struct SdmmcRegs {
    pub sd_host_standard: SdHostRegs,
    pub vendor_clock_cntrl: Reg<u32>,
    pub vendor_sys_sw_cntrl: Reg<u32>,
    pub vendor_err_intr_status: Reg<u32>,
    pub vendor_cap_overrides: Reg<u32>,
    pub vendor_boot_cntrl: Reg<u32>,
    pub vendor_boot_ack_timeout: Reg<u32>,
    pub vendor_boot_dat_timeout: Reg<u32>,
    pub vendor_debounce_count: Reg<u32>,
    pub vendor_misc_cntrl: Reg<u32>,
    pub max_current_override: Reg<u32>,
    pub max_current_override_hi: Reg<u32>,
    _res0: [u32; 37],
    pub vendor_io_trim_cntrl: Reg<u32>,
    pub vendor_dllcal_cfg: Reg<u32>,
    pub vendor_dll_ctrl0: Reg<u32>,
    pub vendor_dll_ctrl1: Reg<u32>,
    pub vendor_dllcal_cfg_sta: RoReg<u32>,
    pub vendor_tuning_cntrl0: Reg<u32>,
    pub vendor_tuning_cntrl1: Reg<u32>,
    pub vendor_tuning_status0: RoReg<u32>,
    pub vendor_tuning_status1: RoReg<u32>,
    pub vendor_clk_gate_hysteresis_count: Reg<u32>,
    pub vendor_preset_val: [Reg<u32>; 3],
    pub sdmemcomppadctrl: Reg<u32>,
    pub auto_cal_config: Reg<u32>,
    pub auto_cal_interval: Reg<u32>,
    pub auto_cal_status: RoReg<u32>,
    pub io_spare: Reg<u32>,
    pub sdmmca_mccif_fifoctrl: Reg<u32>,
    pub timeout_wcoal_sdmmca: Reg<u32>,
}

const_assert_eq!(core::mem::size_of::<SdHostRegs>(), 0x100);
const_assert_eq!(core::mem::size_of::<SdmmcRegs>(), 0x210);

pub const SDMA_BUFFER_BOUNDARY: u64 = 512 * 1024;
pub const BLOCK_COUNT_MAX: u32 = 0xFFFF;
pub const BLOCK_SIZE_MAX: u32 = 0xFFF;
pub const COMMAND_INDEX_MAX: u32 = 0x3F;
pub const BUFFER_ADDRESS_ALIGNMENT: usize = 8;

/// SDMA boundary field of BLOCK_SIZE: 512KB
pub const BLOCK_SIZE_SDMA_BOUNDARY_512K: u16 = 7 << 12;
/// TMCLK * 2^27
pub const DATA_TIMEOUT_COUNTER_MAX: u8 = 0b1110;

pub const COMMAND_INDEX_SHIFT: u16 = 8;

pub const CLOCK_FREQ_SELECT_SHIFT: u16 = 8;
pub const CLOCK_FREQ_SELECT_MASK: u16 = 0xFF << 8;
pub const CLOCK_UPPER_FREQ_SELECT_SHIFT: u16 = 6;
pub const CLOCK_UPPER_FREQ_SELECT_MASK: u16 = 0x3 << 6;

pub const CAPABILITIES_64BIT_SYSTEM_ADDRESS_V3: u32 = 1 << 28;

bitflags::bitflags! {
    pub struct PresentState : u32 {
        const COMMAND_INHIBIT_CMD = 1 << 0;
        const COMMAND_INHIBIT_DAT = 1 << 1;
        const DAT_LINE_ACTIVE = 1 << 2;
        const BUFFER_WRITE_ENABLE = 1 << 10;
        const BUFFER_READ_ENABLE = 1 << 11;
        const CARD_INSERTED = 1 << 16;
        const DAT0_LINE_LEVEL = 1 << 20;
        const DAT1_LINE_LEVEL = 1 << 21;
        const DAT2_LINE_LEVEL = 1 << 22;
        const DAT3_LINE_LEVEL = 1 << 23;
        const CMD_LINE_LEVEL = 1 << 24;

        const DAT_LINES = PresentState::DAT0_LINE_LEVEL.bits |
            PresentState::DAT1_LINE_LEVEL.bits |
            PresentState::DAT2_LINE_LEVEL.bits |
            PresentState::DAT3_LINE_LEVEL.bits;
    }

    pub struct HostControl : u8 {
        const DATA_WIDTH_4BIT = 1 << 1;
        const HIGH_SPEED = 1 << 2;
        // 4:3 - dma select, SDMA = 0
        const DMA_SELECT_MASK = 0x3 << 3;
        const EXTENDED_WIDTH_8BIT = 1 << 5;
    }

    pub struct PowerControl : u8 {
        const BUS_POWER = 1 << 0;
        const VOLTAGE_MASK = 0x7 << 1;
        const VOLTAGE_1_8V = 0x5 << 1;
        const VOLTAGE_3_3V = 0x7 << 1;
    }

    pub struct ClockControl : u16 {
        const INTERNAL_CLOCK_ENABLE = 1 << 0;
        const INTERNAL_CLOCK_STABLE = 1 << 1;
        const SD_CLOCK_ENABLE = 1 << 2;
        // 5 - 0: divided clock, 1: programmable clock
        const PROGRAMMABLE_CLOCK = 1 << 5;
    }

    pub struct SoftwareReset : u8 {
        const RESET_ALL = 1 << 0;
        const RESET_CMD = 1 << 1;
        const RESET_DAT = 1 << 2;
    }

    pub struct NormalInt : u16 {
        const COMMAND_COMPLETE = 1 << 0;
        const TRANSFER_COMPLETE = 1 << 1;
        const BLOCK_GAP_EVENT = 1 << 2;
        const DMA_INTERRUPT = 1 << 3;
        const BUFFER_WRITE_READY = 1 << 4;
        const BUFFER_READ_READY = 1 << 5;
        const CARD_INSERTION = 1 << 6;
        const CARD_REMOVAL = 1 << 7;
        const ERROR_INTERRUPT = 1 << 15;

        const ISSUE_COMMAND = NormalInt::COMMAND_COMPLETE.bits |
            NormalInt::TRANSFER_COMPLETE.bits |
            NormalInt::DMA_INTERRUPT.bits;
    }

    pub struct ErrorInt : u16 {
        const COMMAND_TIMEOUT = 1 << 0;
        const COMMAND_CRC = 1 << 1;
        const COMMAND_END_BIT = 1 << 2;
        const COMMAND_INDEX = 1 << 3;
        const DATA_TIMEOUT = 1 << 4;
        const DATA_CRC = 1 << 5;
        const DATA_END_BIT = 1 << 6;
        const CURRENT_LIMIT = 1 << 7;
        const AUTO_CMD = 1 << 8;
        const ADMA = 1 << 9;

        const ISSUE_COMMAND = ErrorInt::COMMAND_TIMEOUT.bits |
            ErrorInt::COMMAND_CRC.bits |
            ErrorInt::COMMAND_END_BIT.bits |
            ErrorInt::COMMAND_INDEX.bits |
            ErrorInt::DATA_TIMEOUT.bits |
            ErrorInt::DATA_CRC.bits |
            ErrorInt::DATA_END_BIT.bits |
            ErrorInt::AUTO_CMD.bits;
    }

    pub struct AutoCmdError : u16 {
        const NOT_EXECUTED = 1 << 0;
        const TIMEOUT = 1 << 1;
        const CRC = 1 << 2;
        const END_BIT = 1 << 3;
        const INDEX = 1 << 4;
    }

    pub struct TransferMode : u16 {
        const DMA_ENABLE = 1 << 0;
        const BLOCK_COUNT_ENABLE = 1 << 1;
        // 3:2 - auto cmd enable, 01 = CMD12
        const AUTO_CMD12 = 1 << 2;
        const DIRECTION_READ = 1 << 4;
        const MULTI_BLOCK = 1 << 5;
    }

    pub struct CommandReg : u16 {
        // 1:0 - response type
        const RESPONSE_NONE = 0;
        const RESPONSE_136 = 1;
        const RESPONSE_48 = 2;
        const RESPONSE_48_BUSY = 3;
        const CRC_CHECK = 1 << 3;
        const INDEX_CHECK = 1 << 4;
        const DATA_PRESENT = 1 << 5;
        // 13:8 - command index
    }

    pub struct HostControl2 : u16 {
        // 2:0 - UHS mode select
        const UHS_MODE_MASK = 0x7;
        const SIGNALING_1_8V = 1 << 3;
        const EXECUTE_TUNING = 1 << 6;
        const SAMPLING_CLOCK_TUNED = 1 << 7;
        const HOST_VERSION_4 = 1 << 12;
        const ADDRESSING_64BIT = 1 << 13;
        const PRESET_VALUE_ENABLE = 1 << 15;
    }
}

/// HOST_CONTROL2 UHS mode select values.
pub mod uhs_mode {
    pub const SDR12: u16 = 0;
    pub const SDR25: u16 = 1;
    pub const SDR50: u16 = 2;
    pub const SDR104: u16 = 3;
    pub const HS200: u16 = 3;
    pub const DDR50: u16 = 4;
    pub const HS400: u16 = 5;
}

// Vendor register fields
pub const VENDOR_CLOCK_SPI_MODE_CLKEN_OVERRIDE: u32 = 1 << 2;
pub const VENDOR_CLOCK_PADPIPE_CLKEN_OVERRIDE: u32 = 1 << 3;
pub const VENDOR_CLOCK_TAP_VAL_SHIFT: u32 = 16;
pub const VENDOR_CLOCK_TAP_VAL_MASK: u32 = 0xFF << 16;
pub const VENDOR_CLOCK_TRIM_VAL_SHIFT: u32 = 24;
pub const VENDOR_CLOCK_TRIM_VAL_MASK: u32 = 0x1F << 24;

pub const VENDOR_CAP_OVERRIDES_DQS_TRIM_SHIFT: u32 = 8;
pub const VENDOR_CAP_OVERRIDES_DQS_TRIM_MASK: u32 = 0x3F << 8;
pub const VENDOR_CAP_OVERRIDES_DQS_TRIM_HS400: u32 = 40;

pub const IO_TRIM_CNTRL_SEL_VREG: u32 = 1 << 2;

pub const DLLCAL_CFG_CALIBRATE: u32 = 1 << 31;
pub const DLLCAL_CFG_STA_DLL_CAL_ACTIVE: u32 = 1 << 31;

pub const TUNING_CNTRL0_MUL_M_SHIFT: u32 = 6;
pub const TUNING_CNTRL0_MUL_M_MASK: u32 = 0x7F << 6;
pub const TUNING_CNTRL0_NUM_TUNING_ITERATIONS_SHIFT: u32 = 13;
pub const TUNING_CNTRL0_NUM_TUNING_ITERATIONS_MASK: u32 = 0x7 << 13;
pub const TUNING_ITERATIONS_TRIES_128: u32 = 4;
pub const TUNING_ITERATIONS_TRIES_256: u32 = 5;
pub const TUNING_CNTRL0_TAP_VALUE_UPDATED_BY_HW: u32 = 1 << 17;

pub const SDMEMCOMPPADCTRL_VREF_SEL_MASK: u32 = 0xF;
pub const SDMEMCOMPPADCTRL_PAD_E_INPUT_OR_E_PWRD: u32 = 1 << 31;

pub const AUTO_CAL_CONFIG_PU_OFFSET_MASK: u32 = 0x7F;
pub const AUTO_CAL_CONFIG_PD_OFFSET_SHIFT: u32 = 8;
pub const AUTO_CAL_CONFIG_PD_OFFSET_MASK: u32 = 0x7F << 8;
pub const AUTO_CAL_CONFIG_ENABLE: u32 = 1 << 29;
pub const AUTO_CAL_CONFIG_START: u32 = 1 << 31;

pub const AUTO_CAL_STATUS_PULLUP_MASK: u32 = 0x1F;
pub const AUTO_CAL_STATUS_ACTIVE: u32 = 1 << 31;

pub const IO_SPARE_SPARE_OUT_3: u32 = 1 << 19;

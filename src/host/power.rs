//! Bus power sequencing for the SD card slot (SDMMC1).
//!
//! The slot's IO rail is fed either by a regulator the driver programs
//! itself over I2C, or by the power-management coprocessor.

use super::BusPower;
use crate::error::SdResult;
use crate::hal::*;
use crate::timer::wait_microseconds;
use alloc::boxed::Box;
use core::convert::Infallible;

pub const PMC_BASE_ADDR: PhysAddr = 0x7000_E400;
const PMC_NO_IOPOWER: PhysAddr = PMC_BASE_ADDR + 0x44;
const PMC_PWR_DET_VAL: PhysAddr = PMC_BASE_ADDR + 0xE4;
const PMC_SDMMC1: u32 = 1 << 12;

pub const PINMUX_BASE_ADDR: PhysAddr = 0x7000_3000;
/// CLK, CMD, DAT3, DAT2, DAT1, DAT0
const PINMUX_AUX_SDMMC1: [PhysAddr; 6] = [
    PINMUX_BASE_ADDR,
    PINMUX_BASE_ADDR + 0x04,
    PINMUX_BASE_ADDR + 0x08,
    PINMUX_BASE_ADDR + 0x0C,
    PINMUX_BASE_ADDR + 0x10,
    PINMUX_BASE_ADDR + 0x14,
];
const PINMUX_PUPD_MASK: u32 = 0x3 << 2;
const PINMUX_PULL_DOWN: u32 = 1 << 2;
const PINMUX_PULL_UP: u32 = 2 << 2;
const PINMUX_TRISTATE: u32 = 1 << 4;
const PINMUX_SCHMT: u32 = 1 << 12;

// MAX77620 LDO2 feeds VDDIO_SDMMC1
const MAX77620_LDO2_CFG: u8 = 0x27;
const LDO_VOLTAGE_MASK: u8 = 0x3F;
const LDO_POWER_MODE_MASK: u8 = 0xC0;
const LDO_POWER_MODE_NORMAL: u8 = 0xC0;
const LDO_MIN_UV: u32 = 800_000;
const LDO_STEP_UV: u32 = 50_000;

const VOLTAGE_3_3V_UV: u32 = 3_300_000;
const VOLTAGE_1_8V_UV: u32 = 1_800_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PadState {
    OutputHigh,
    Reset,
}

fn set_pad_state(state: PadState) {
    let value = match state {
        PadState::OutputHigh => PINMUX_PULL_UP,
        PadState::Reset => PINMUX_PULL_DOWN | PINMUX_TRISTATE,
    };
    for &pad in PINMUX_AUX_SDMMC1.iter() {
        reg32(pad).write_field(PINMUX_PUPD_MASK | PINMUX_TRISTATE, value);
    }
}

/// Schmitt trigger on the slot's data/command pads.
pub(super) fn set_sdmmc1_schmitt_trigger(enable: bool) {
    for &pad in PINMUX_AUX_SDMMC1.iter() {
        if enable {
            reg32(pad).set_bits(PINMUX_SCHMT);
        } else {
            reg32(pad).clear_bits(PINMUX_SCHMT);
        }
    }
}

fn set_io_rail(enable: bool) {
    // NO_IOPOWER: set means unpowered
    if enable {
        reg32(PMC_NO_IOPOWER).clear_bits(PMC_SDMMC1);
    } else {
        reg32(PMC_NO_IOPOWER).set_bits(PMC_SDMMC1);
    }
}

fn set_io_voltage_detect(bus_power: BusPower) {
    match bus_power {
        BusPower::V3_3 => reg32(PMC_PWR_DET_VAL).set_bits(PMC_SDMMC1),
        BusPower::V1_8 => reg32(PMC_PWR_DET_VAL).clear_bits(PMC_SDMMC1),
        BusPower::Off => panic!("no detect level for a powered-off bus"),
    }
}

/// The LDO feeding the slot, reached over a two-wire session.
struct Ldo2 {
    i2c: Box<dyn I2cSession>,
}

impl Ldo2 {
    fn set_voltage(&mut self, microvolts: u32) -> SdResult {
        assert!(microvolts >= LDO_MIN_UV);
        let code = ((microvolts - LDO_MIN_UV) / LDO_STEP_UV) as u8 & LDO_VOLTAGE_MASK;
        let cfg = self.i2c.read_register(MAX77620_LDO2_CFG)?;
        self.i2c
            .write_register(MAX77620_LDO2_CFG, (cfg & !LDO_VOLTAGE_MASK) | code)
    }

    fn set_enabled(&mut self, enable: bool) -> SdResult {
        let cfg = self.i2c.read_register(MAX77620_LDO2_CFG)? & !LDO_POWER_MODE_MASK;
        let mode = if enable { LDO_POWER_MODE_NORMAL } else { 0 };
        self.i2c.write_register(MAX77620_LDO2_CFG, cfg | mode)
    }
}

fn drive(pin: &mut dyn PowerPin, high: bool) {
    let res: Result<(), Infallible> = if high { pin.set_high() } else { pin.set_low() };
    res.unwrap_or_else(|never| match never {})
}

/// Powers the slot by toggling the power GPIO, the PMC IO rail and the LDO.
pub struct RegisterPowerController {
    power_pin: Box<dyn PowerPin>,
    regulator: Ldo2,
    current_bus_power: BusPower,
}

impl RegisterPowerController {
    pub fn new(power_pin: Box<dyn PowerPin>, regulator: Box<dyn I2cSession>) -> Self {
        Self {
            power_pin,
            regulator: Ldo2 { i2c: regulator },
            current_bus_power: BusPower::Off,
        }
    }

    pub fn current_bus_power(&self) -> BusPower {
        self.current_bus_power
    }

    pub fn power_on(&mut self, bus_power: BusPower) -> SdResult {
        assert_eq!(self.current_bus_power, BusPower::Off);
        assert_eq!(bus_power, BusPower::V3_3, "the slot powers up at 3.3V only");

        set_io_rail(true);
        set_io_voltage_detect(BusPower::V3_3);
        drive(self.power_pin.as_mut(), true);
        wait_microseconds(10_000);

        self.regulator.set_voltage(VOLTAGE_3_3V_UV)?;
        self.regulator.set_enabled(true)?;
        wait_microseconds(130);

        self.current_bus_power = BusPower::V3_3;
        Ok(())
    }

    pub fn lower_bus_power(&mut self) -> SdResult {
        assert_eq!(self.current_bus_power, BusPower::V3_3);
        let res = self.regulator.set_voltage(VOLTAGE_1_8V_UV);
        wait_microseconds(150);
        set_io_voltage_detect(BusPower::V1_8);
        // pads follow the detect level even if the LDO write failed
        self.current_bus_power = BusPower::V1_8;
        res
    }

    pub fn power_off(&mut self) {
        if self.current_bus_power == BusPower::Off {
            return;
        }
        if self.current_bus_power == BusPower::V3_3 {
            if let Err(err) = self.lower_bus_power() {
                warn!("sdmmc1: lowering bus power before power off failed: {:?}", err);
            }
        }

        set_pad_state(PadState::OutputHigh);

        if let Err(err) = self.regulator.set_enabled(false) {
            warn!("sdmmc1: regulator disable failed: {:?}", err);
        }
        wait_microseconds(4_000);
        drive(self.power_pin.as_mut(), false);
        wait_microseconds(239_000);
        set_io_rail(false);
        set_io_voltage_detect(BusPower::V3_3);
        self.current_bus_power = BusPower::Off;

        set_pad_state(PadState::Reset);
    }
}

/// Powers the slot through the power-management coprocessor.
pub struct PcvPowerController {
    pcv: Box<dyn PcvControl>,
    current_bus_power: BusPower,
}

impl PcvPowerController {
    pub fn new(pcv: Box<dyn PcvControl>) -> Self {
        Self {
            pcv,
            current_bus_power: BusPower::Off,
        }
    }

    pub fn power_on(&mut self, bus_power: BusPower) -> SdResult {
        assert_eq!(bus_power, BusPower::V3_3, "the slot powers up at 3.3V only");
        self.pcv.set_voltage_value(VOLTAGE_3_3V_UV)?;
        self.pcv.set_voltage_enabled(true)?;
        self.current_bus_power = BusPower::V3_3;
        Ok(())
    }

    pub fn lower_bus_power(&mut self) -> SdResult {
        self.pcv.set_voltage_value(VOLTAGE_1_8V_UV)?;
        self.current_bus_power = BusPower::V1_8;
        Ok(())
    }

    pub fn power_off(&mut self) {
        if self.current_bus_power == BusPower::Off {
            return;
        }
        if let Err(err) = self.pcv.set_voltage_enabled(false) {
            warn!("sdmmc1: pcv disable failed: {:?}", err);
        }
        self.current_bus_power = BusPower::Off;
    }
}

pub enum PowerControlStrategy {
    Register(RegisterPowerController),
    Pcv(PcvPowerController),
}

impl PowerControlStrategy {
    pub fn power_on(&mut self, bus_power: BusPower) -> SdResult {
        match self {
            PowerControlStrategy::Register(ctrl) => ctrl.power_on(bus_power),
            PowerControlStrategy::Pcv(ctrl) => ctrl.power_on(bus_power),
        }
    }

    pub fn power_off(&mut self) {
        match self {
            PowerControlStrategy::Register(ctrl) => ctrl.power_off(),
            PowerControlStrategy::Pcv(ctrl) => ctrl.power_off(),
        }
    }

    pub fn lower_bus_power(&mut self) -> SdResult {
        match self {
            PowerControlStrategy::Register(ctrl) => ctrl.lower_bus_power(),
            PowerControlStrategy::Pcv(ctrl) => ctrl.lower_bus_power(),
        }
    }
}

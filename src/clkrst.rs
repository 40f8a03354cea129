//! Clock and reset control for the four SDMMC modules.

use crate::hal::*;
use crate::timer::wait_clocks;
use spin::Mutex;

pub const CLKRST_BASE_ADDR: PhysAddr = 0x6000_6000;
pub const CLKRST_SIZE: usize = PAGE_SIZE;

const RST_DEVICES_L: usize = 0x004;
const RST_DEVICES_U: usize = 0x00C;
const CLK_OUT_ENB_L: usize = 0x010;
const CLK_OUT_ENB_U: usize = 0x018;
const CLK_SOURCE_SDMMC1: usize = 0x150;
const CLK_SOURCE_SDMMC2: usize = 0x154;
const CLK_SOURCE_SDMMC4: usize = 0x164;
const CLK_SOURCE_SDMMC3: usize = 0x1BC;
const CLK_ENB_Y_SET: usize = 0x29C;
const RST_DEV_L_SET: usize = 0x300;
const RST_DEV_L_CLR: usize = 0x304;
const RST_DEV_U_SET: usize = 0x310;
const RST_DEV_U_CLR: usize = 0x314;
const CLK_ENB_L_SET: usize = 0x320;
const CLK_ENB_L_CLR: usize = 0x324;
const CLK_ENB_U_SET: usize = 0x330;
const CLK_ENB_U_CLR: usize = 0x334;
const CLK_SOURCE_SDMMC_LEGACY_TM: usize = 0x694;

const CLK_SRC_SHIFT: u32 = 29;
const CLK_SRC_PLLP_OUT0: u32 = 0;
const CLK_ENB_LEGACY_TM: u32 = 1 << 1;
/// PLLP_OUT0 / (1 + 66 / 2) = 12MHz
const LEGACY_TM_DIVISOR: u32 = 66;

/// One physical SDMMC controller instance.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Module {
    Sdmmc1 = 0,
    Sdmmc2 = 1,
    Sdmmc3 = 2,
    Sdmmc4 = 3,
}

const MODULE_COUNT: usize = 4;

struct ModuleRegs {
    rst_devices: usize,
    rst_set: usize,
    rst_clr: usize,
    clk_out_enb: usize,
    clk_enb_set: usize,
    clk_enb_clr: usize,
    clk_source: usize,
    mask: u32,
}

impl Module {
    fn regs(self) -> ModuleRegs {
        let (bank_l, clk_source, bit) = match self {
            Module::Sdmmc1 => (true, CLK_SOURCE_SDMMC1, 14),
            Module::Sdmmc2 => (true, CLK_SOURCE_SDMMC2, 9),
            Module::Sdmmc3 => (false, CLK_SOURCE_SDMMC3, 5),
            Module::Sdmmc4 => (true, CLK_SOURCE_SDMMC4, 15),
        };
        if bank_l {
            ModuleRegs {
                rst_devices: RST_DEVICES_L,
                rst_set: RST_DEV_L_SET,
                rst_clr: RST_DEV_L_CLR,
                clk_out_enb: CLK_OUT_ENB_L,
                clk_enb_set: CLK_ENB_L_SET,
                clk_enb_clr: CLK_ENB_L_CLR,
                clk_source,
                mask: 1 << bit,
            }
        } else {
            ModuleRegs {
                rst_devices: RST_DEVICES_U,
                rst_set: RST_DEV_U_SET,
                rst_clr: RST_DEV_U_CLR,
                clk_out_enb: CLK_OUT_ENB_U,
                clk_enb_set: CLK_ENB_U_SET,
                clk_enb_clr: CLK_ENB_U_CLR,
                clk_source,
                mask: 1 << bit,
            }
        }
    }
}

/// Divider settings reachable from PLLP_OUT0: (actual kHz, n).
pub fn clock_source_divisor(target_khz: u32) -> (u32, u32) {
    match target_khz {
        25_000 => (24_728, 31),
        26_000 => (25_500, 30),
        40_800 => (40_800, 18),
        50_000 => (48_000, 15),
        52_000 => (51_000, 14),
        100_000 => (90_667, 7),
        200_000 => (163_200, 3),
        208_000 => (204_000, 2),
        _ => panic!("unsupported sdmmc source frequency {}kHz", target_khz),
    }
}

#[derive(Default, Clone, Copy)]
struct ModuleInfo {
    target_khz: u32,
    actual_khz: u32,
}

struct ClockResetController {
    base: VirtAddr,
    modules: [ModuleInfo; MODULE_COUNT],
}

lazy_static::lazy_static! {
    static ref CLKRST: Mutex<Option<ClockResetController>> = Mutex::new(None);
}

impl ClockResetController {
    fn reg(&self, offset: usize) -> &Reg<u32> {
        unsafe { &*((self.base + offset) as *const Reg<u32>) }
    }

    fn ensure_control(&self, module: Module) {
        self.reg(module.regs().rst_devices).read();
    }

    fn is_reset_released(&self, module: Module) -> bool {
        let regs = module.regs();
        self.reg(regs.rst_devices).read() & regs.mask == 0
    }

    fn is_clock_enabled(&self, module: Module) -> bool {
        let regs = module.regs();
        self.reg(regs.clk_out_enb).read() & regs.mask != 0
    }

    fn set_reset(&self, module: Module) {
        let regs = module.regs();
        self.reg(regs.rst_set).write(regs.mask);
    }

    fn clear_reset(&self, module: Module) {
        let regs = module.regs();
        self.reg(regs.rst_clr).write(regs.mask);
    }

    fn set_clock_enable(&self, module: Module) {
        let regs = module.regs();
        self.reg(regs.clk_enb_set).write(regs.mask);
    }

    fn clear_clock_enable(&self, module: Module) {
        let regs = module.regs();
        self.reg(regs.clk_enb_clr).write(regs.mask);
    }

    fn set_clock_source(&mut self, module: Module, target_khz: u32) -> u32 {
        let (actual_khz, n) = clock_source_divisor(target_khz);
        self.modules[module as usize] = ModuleInfo {
            target_khz,
            actual_khz,
        };
        self.reg(module.regs().clk_source)
            .write((CLK_SRC_PLLP_OUT0 << CLK_SRC_SHIFT) | n);
        actual_khz
    }
}

fn with_controller<R>(f: impl FnOnce(&mut ClockResetController) -> R) -> R {
    let mut guard = CLKRST.lock();
    match guard.as_mut() {
        Some(car) => f(car),
        None => panic!("clock/reset controller used before initialize"),
    }
}

/// Map the controller and start the legacy TM clock. Only the first call
/// does anything; the module table lives for the process lifetime.
pub fn initialize(module: Module) {
    let mut guard = CLKRST.lock();
    if guard.is_some() {
        return;
    }
    let car = ClockResetController {
        base: phys_to_virt(CLKRST_BASE_ADDR),
        modules: [ModuleInfo::default(); MODULE_COUNT],
    };
    car.reg(CLK_SOURCE_SDMMC_LEGACY_TM)
        .write((CLK_SRC_PLLP_OUT0 << CLK_SRC_SHIFT) | LEGACY_TM_DIVISOR);
    car.reg(CLK_ENB_Y_SET).write(CLK_ENB_LEGACY_TM);
    info!("clkrst: initialized by {:?}", module);
    *guard = Some(car);
}

pub fn finalize(_module: Module) {}

pub fn is_available(module: Module) -> bool {
    with_controller(|car| car.is_reset_released(module) && car.is_clock_enabled(module))
}

/// Reprogram the source divider, returning the frequency actually reached.
pub fn set_clock_frequency_khz(module: Module, target_khz: u32) -> u32 {
    with_controller(|car| {
        let info = car.modules[module as usize];
        if info.target_khz == target_khz {
            return info.actual_khz;
        }
        let clock_enabled = car.is_clock_enabled(module);
        if clock_enabled {
            car.clear_clock_enable(module);
        }
        let actual_khz = car.set_clock_source(module, target_khz);
        if clock_enabled {
            car.set_clock_enable(module);
        }
        car.ensure_control(module);
        debug!("clkrst: {:?} {}kHz -> {}kHz", module, target_khz, actual_khz);
        actual_khz
    })
}

pub fn assert_reset(module: Module) {
    with_controller(|car| {
        car.set_reset(module);
        car.clear_clock_enable(module);
        car.ensure_control(module);
    })
}

pub fn release_reset(module: Module, target_khz: u32) {
    with_controller(|car| {
        if car.is_clock_enabled(module) {
            car.clear_clock_enable(module);
        }
        car.set_reset(module);
        let actual_khz = car.set_clock_source(module, target_khz);
        car.set_clock_enable(module);
        car.ensure_control(module);
        wait_clocks(100, actual_khz);
        car.clear_reset(module);
        car.ensure_control(module);
    })
}

#[cfg(test)]
pub(crate) fn fake_window() -> VirtAddr {
    testing::fake_mmio(CLKRST_BASE_ADDR, CLKRST_SIZE)
}

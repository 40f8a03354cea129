use crate::error::SdResult;
use core::convert::Infallible;
use core::fmt;
use core::ops::{BitAnd, BitOr, Deref, Not};
use core::sync::atomic::{fence, AtomicBool, Ordering};
use embedded_hal::digital::v2::{InputPin, OutputPin};
use spin::Once;

pub const PAGE_SIZE: usize = 4096;

pub type VirtAddr = usize;
pub type PhysAddr = usize;

/// Integer widths a register cell can hold.
pub trait RegValue:
    Copy + PartialEq + BitAnd<Output = Self> + BitOr<Output = Self> + Not<Output = Self>
{
    const ZERO: Self;
}

impl RegValue for u8 {
    const ZERO: Self = 0;
}
impl RegValue for u16 {
    const ZERO: Self = 0;
}
impl RegValue for u32 {
    const ZERO: Self = 0;
}

#[repr(transparent)]
pub struct Reg<T: Copy>(volatile_register::RW<T>);

impl<T: Copy + fmt::LowerHex> fmt::Debug for Reg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Reg[RW] {:#x}", self.0.read()))
    }
}

/// #Safety: every register block is only reached through its owner's lock
unsafe impl<T: Copy> Sync for Reg<T> {}

impl<T: RegValue> Reg<T> {
    pub fn read(&self) -> T {
        self.0.read()
    }

    pub fn write(&self, value: T) {
        unsafe { self.0.write(value) };
    }

    pub fn modify<F: FnOnce(T) -> T>(&self, f: F) {
        unsafe { self.0.modify(f) };
    }

    pub fn set_bits(&self, mask: T) {
        self.modify(|x| x | mask);
    }

    pub fn clear_bits(&self, mask: T) {
        self.modify(|x| x & !mask);
    }

    /// Replace the bits under `mask` with `value` (already shifted).
    pub fn write_field(&self, mask: T, value: T) {
        self.modify(|x| (x & !mask) | (value & mask));
    }

    pub fn has_bits(&self, mask: T) -> bool {
        self.read() & mask == mask
    }

    pub fn any_bits(&self, mask: T) -> bool {
        self.read() & mask != T::ZERO
    }
}

/// Read-only status register.
#[repr(transparent)]
pub struct RoReg<T: Copy>(vcell::VolatileCell<T>);

unsafe impl<T: Copy> Sync for RoReg<T> {}

impl<T: RegValue> RoReg<T> {
    pub fn read(&self) -> T {
        self.0.get()
    }

    pub fn has_bits(&self, mask: T) -> bool {
        self.read() & mask == mask
    }

    /// Stand-in for the hardware driving the register.
    #[cfg(test)]
    pub fn preset(&self, value: T) {
        self.0.set(value)
    }
}

/// A `#[repr(C)]` register layout mapped at a fixed address. Registers are
/// interior-mutable cells, so a shared view is all a driver needs and two
/// views of overlapping windows may coexist.
pub struct RegBlock<'a, T> {
    ptr: &'a T,
}

impl<'a, T> RegBlock<'a, T> {
    pub fn from_raw(base_addr: PhysAddr) -> Self {
        Self {
            ptr: unsafe { &*(phys_to_virt(base_addr) as *const T) },
        }
    }

    /// #Safety: `vaddr` must point at a live, suitably aligned `T`
    pub unsafe fn from_virt(vaddr: VirtAddr) -> Self {
        Self {
            ptr: &*(vaddr as *const T),
        }
    }

    pub fn addr(&self) -> VirtAddr {
        self.ptr as *const T as VirtAddr
    }

    pub fn get(&self) -> &'a T {
        self.ptr
    }
}

impl<T> Deref for RegBlock<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.ptr
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocType {
    Erista,
    Mariko,
}

/// Services the surrounding firmware provides to the driver.
pub trait Platform: Send + Sync {
    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr;
    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr;
    fn flush_data_cache(&self, vaddr: VirtAddr, len: usize);
    fn invalidate_data_cache(&self, vaddr: VirtAddr, len: usize);
    /// Monotonic microsecond counter.
    fn tick_microseconds(&self) -> u64;
    fn soc_type(&self) -> SocType;

    fn sleep_microseconds(&self, us: u64) {
        let deadline = self.tick_microseconds() + us;
        while self.tick_microseconds() < deadline {
            core::hint::spin_loop();
        }
    }

    /// Block until one of `events` is signaled, returning its index.
    fn wait_any(&self, events: &[&dyn Event]) -> usize {
        loop {
            if let Some(idx) = events.iter().position(|e| e.is_signaled()) {
                return idx;
            }
            self.sleep_microseconds(100);
        }
    }

    fn timed_wait_any(&self, events: &[&dyn Event], timeout_us: u64) -> Option<usize> {
        let deadline = self.tick_microseconds() + timeout_us;
        loop {
            if let Some(idx) = events.iter().position(|e| e.is_signaled()) {
                return Some(idx);
            }
            if self.tick_microseconds() > deadline {
                return None;
            }
            core::hint::spin_loop();
        }
    }
}

static PLATFORM: Once<&'static dyn Platform> = Once::new();
static SOC_TYPE: Once<SocType> = Once::new();

/// Register the platform hooks. Only the first call has an effect.
pub fn init_platform(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

pub(crate) fn platform() -> &'static dyn Platform {
    match PLATFORM.get() {
        Some(p) => *p,
        None => panic!("sdmmc platform hooks are not registered"),
    }
}

/// SoC generation, queried once and cached for the process lifetime.
pub fn soc_type() -> SocType {
    *SOC_TYPE.call_once(|| platform().soc_type())
}

pub fn is_soc_mariko() -> bool {
    soc_type() == SocType::Mariko
}

pub fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
    platform().phys_to_virt(paddr)
}

pub fn virt_to_phys(vaddr: VirtAddr) -> PhysAddr {
    platform().virt_to_phys(vaddr)
}

/// A lone 32-bit register at a physical address.
pub fn reg32(paddr: PhysAddr) -> &'static Reg<u32> {
    unsafe { &*(phys_to_virt(paddr) as *const Reg<u32>) }
}

pub fn flush_data_cache(vaddr: VirtAddr, len: usize) {
    fence(Ordering::SeqCst);
    platform().flush_data_cache(vaddr, len);
}

pub fn invalidate_data_cache(vaddr: VirtAddr, len: usize) {
    platform().invalidate_data_cache(vaddr, len);
    fence(Ordering::SeqCst);
}

/// Waitable signal shared between the driver and its collaborators.
pub trait Event: Send + Sync {
    fn signal(&self);
    fn clear(&self);
    fn is_signaled(&self) -> bool;

    fn wait(&self) {
        platform().wait_any(&[self.as_event()]);
    }

    fn timed_wait(&self, timeout_us: u64) -> bool {
        platform()
            .timed_wait_any(&[self.as_event()], timeout_us)
            .is_some()
    }

    fn as_event(&self) -> &dyn Event;
}

/// Manual-clear event over a single flag.
#[derive(Default)]
pub struct AtomicEvent {
    flag: AtomicBool,
}

impl AtomicEvent {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }
}

impl Event for AtomicEvent {
    fn signal(&self) {
        self.flag.store(true, Ordering::Release);
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn as_event(&self) -> &dyn Event {
        self
    }
}

/// Output pad that gates a power rail.
pub trait PowerPin: OutputPin<Error = Infallible> + Send {}
impl<T: OutputPin<Error = Infallible> + Send> PowerPin for T {}

/// Card-detect pad with its edge interrupt.
pub trait CardDetectPad: InputPin<Error = Infallible> + Send + Sync {
    fn set_interrupt_enable(&self, enable: bool);
    fn clear_interrupt_status(&self);
    /// The pad woke the system from sleep.
    fn is_wake_event_active(&self) -> bool;
    fn interrupt_event(&self) -> &dyn Event;
}

/// Register transactions on a two-wire bus device.
pub trait I2cSession: Send {
    fn write_register(&mut self, reg: u8, value: u8) -> SdResult;
    fn read_register(&mut self, reg: u8) -> SdResult<u8>;
}

/// Rail control through the power-management coprocessor.
pub trait PcvControl: Send {
    fn set_voltage_enabled(&mut self, enable: bool) -> SdResult;
    fn set_voltage_value(&mut self, microvolts: u32) -> SdResult;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Demo {
        ctrl: Reg<u16>,
        width: Reg<u8>,
        state: RoReg<u8>,
        status: Reg<u32>,
    }

    #[test]
    fn register_bit_helpers() {
        testing::install();
        let regs = testing::fake_regs::<Demo>();
        regs.ctrl.write(0x00F0);
        regs.ctrl.set_bits(0x0001);
        regs.ctrl.clear_bits(0x0010);
        assert_eq!(regs.ctrl.read(), 0x00E1);
        regs.ctrl.write_field(0x0F00, 0x0A00);
        assert_eq!(regs.ctrl.read(), 0x0AE1);
        assert!(regs.ctrl.has_bits(0x0A01));
        assert!(!regs.ctrl.has_bits(0x0101));
        assert!(regs.ctrl.any_bits(0x0101));
        regs.width.write(0x20);
        assert_eq!(regs.width.read(), 0x20);
        regs.state.preset(0x3);
        assert!(regs.state.has_bits(0x2));
        regs.status.write(u32::MAX);
        assert_eq!(regs.status.read(), u32::MAX);
    }

    #[test]
    fn atomic_event_is_manual_clear() {
        testing::install();
        let event = AtomicEvent::new();
        assert!(!event.is_signaled());
        assert!(!event.timed_wait(1000));
        event.signal();
        assert!(event.is_signaled());
        assert!(event.timed_wait(1000));
        assert!(event.is_signaled());
        event.clear();
        assert!(!event.is_signaled());
    }

    #[test]
    fn wait_any_reports_first_signaled() {
        testing::install();
        let a = AtomicEvent::new();
        let b = AtomicEvent::new();
        b.signal();
        assert_eq!(platform().wait_any(&[&a, &b]), 1);
        assert_eq!(platform().timed_wait_any(&[&a], 50), None);
    }

    #[test]
    fn soc_type_is_cached() {
        testing::install();
        assert_eq!(soc_type(), SocType::Erista);
        assert!(!is_soc_mariko());
    }
}

//! Passive record of an attached device: identification registers,
//! capacity and the active/awake flags, plus R1 status decoding.

use crate::error::{SdError, SdResult};
use crate::hal::Event;
use alloc::sync::Arc;

pub const CID_SIZE: usize = 16;
pub const CSD_SIZE: usize = 16;

/// Relative address assigned to an eMMC during identification.
pub const MMC_RCA: u16 = 2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceType {
    Mmc,
    SdCard,
    GcAsic,
}

/// CURRENT_STATE field of an R1 response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceState {
    Idle,
    Ready,
    Ident,
    Stby,
    Tran,
    Data,
    Rcv,
    Prg,
    Dis,
    Reserved(u8),
    /// Matches any state when checking a response.
    Unknown,
}

impl DeviceState {
    pub fn from_status(status: u32) -> Self {
        use self::DeviceState::*;
        let state = (status & DeviceStatus::CURRENT_STATE.bits()) >> CURRENT_STATE_SHIFT;
        match state {
            0 => Idle,
            1 => Ready,
            2 => Ident,
            3 => Stby,
            4 => Tran,
            5 => Data,
            6 => Rcv,
            7 => Prg,
            8 => Dis,
            n => Reserved(n as u8),
        }
    }
}

const CURRENT_STATE_SHIFT: u32 = 9;

bitflags::bitflags! {
    pub struct DeviceStatus: u32 {
        const AKE_SEQ_ERROR = 1 << 3;
        const APP_CMD = 1 << 5;
        const SWITCH_ERROR = 1 << 7;
        const CURRENT_STATE = 0b1111 << 9;
        const ERASE_RESET = 1 << 13;
        const WP_ERASE_SKIP = 1 << 15;
        const CID_CSD_OVERWRITE = 1 << 16;
        const ERROR = 1 << 19;
        const CC_ERROR = 1 << 20;
        const DEVICE_ECC_FAILED = 1 << 21;
        const ILLEGAL_COMMAND = 1 << 22;
        const COM_CRC_ERROR = 1 << 23;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const WP_VIOLATION = 1 << 26;
        const ERASE_PARAM = 1 << 27;
        const ERASE_SEQ_ERROR = 1 << 28;
        const BLOCK_LEN_ERROR = 1 << 29;
        const ADDRESS_MISALIGNED = 1 << 30;
        const ADDRESS_OUT_OF_RANGE = 1 << 31;
        const ERROR_MASK = Self::SWITCH_ERROR.bits
            | Self::ERASE_RESET.bits
            | Self::WP_ERASE_SKIP.bits
            | Self::CID_CSD_OVERWRITE.bits
            | Self::ERROR.bits
            | Self::CC_ERROR.bits
            | Self::DEVICE_ECC_FAILED.bits
            | Self::ILLEGAL_COMMAND.bits
            | Self::COM_CRC_ERROR.bits
            | Self::LOCK_UNLOCK_FAILED.bits
            | Self::WP_VIOLATION.bits
            | Self::ERASE_PARAM.bits
            | Self::ERASE_SEQ_ERROR.bits
            | Self::BLOCK_LEN_ERROR.bits
            | Self::ADDRESS_MISALIGNED.bits
            | Self::ADDRESS_OUT_OF_RANGE.bits;
    }
}

/// Status bits in the order they are reported; the first one set wins.
const STATUS_ERRORS: [(DeviceStatus, SdError); 16] = [
    (DeviceStatus::COM_CRC_ERROR, SdError::DeviceStatusComCrcError),
    (DeviceStatus::DEVICE_ECC_FAILED, SdError::DeviceStatusDeviceEccFailed),
    (DeviceStatus::CC_ERROR, SdError::DeviceStatusCcError),
    (DeviceStatus::ERROR, SdError::DeviceStatusError),
    (DeviceStatus::SWITCH_ERROR, SdError::DeviceStatusSwitchError),
    (DeviceStatus::ADDRESS_MISALIGNED, SdError::DeviceStatusAddressMisaligned),
    (DeviceStatus::BLOCK_LEN_ERROR, SdError::DeviceStatusBlockLenError),
    (DeviceStatus::ERASE_SEQ_ERROR, SdError::DeviceStatusEraseSeqError),
    (DeviceStatus::ERASE_PARAM, SdError::DeviceStatusEraseParam),
    (DeviceStatus::WP_VIOLATION, SdError::DeviceStatusWpViolation),
    (DeviceStatus::LOCK_UNLOCK_FAILED, SdError::DeviceStatusLockUnlockFailed),
    (DeviceStatus::CID_CSD_OVERWRITE, SdError::DeviceStatusCidCsdOverwrite),
    (DeviceStatus::WP_ERASE_SKIP, SdError::DeviceStatusWpEraseSkip),
    (DeviceStatus::ERASE_RESET, SdError::DeviceStatusEraseReset),
    (DeviceStatus::ILLEGAL_COMMAND, SdError::DeviceStatusIllegalCommand),
    (DeviceStatus::ADDRESS_OUT_OF_RANGE, SdError::DeviceStatusAddressOutOfRange),
];

/// One physical device slot.
///
/// Identification fields are only meaningful between a successful
/// activation and the next deactivation; reading one outside that window
/// is a bug in the caller and panics.
pub struct Device {
    device_type: DeviceType,
    ocr: Option<u32>,
    cid: Option<[u8; CID_SIZE]>,
    csd: Option<[u8; CSD_SIZE]>,
    memory_capacity: Option<u32>,
    high_capacity: Option<bool>,
    rca: Option<u16>,
    is_active: bool,
    is_awake: bool,
    removed_event: Option<Arc<dyn Event>>,
}

fn words_to_bytes(words: &[u32; 4]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

impl Device {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            ocr: None,
            cid: None,
            csd: None,
            memory_capacity: None,
            high_capacity: None,
            rca: Self::fixed_rca(device_type),
            is_active: false,
            is_awake: true,
            removed_event: None,
        }
    }

    fn fixed_rca(device_type: DeviceType) -> Option<u16> {
        match device_type {
            DeviceType::Mmc => Some(MMC_RCA),
            DeviceType::GcAsic => Some(0),
            DeviceType::SdCard => None,
        }
    }

    /// Attach the event that reports physical removal.
    pub fn with_removed_event(mut self, event: Arc<dyn Event>) -> Self {
        self.removed_event = Some(event);
        self
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn removed_event(&self) -> Option<Arc<dyn Event>> {
        self.removed_event.clone()
    }

    pub fn is_awake(&self) -> bool {
        self.is_awake
    }

    pub fn awaken(&mut self) {
        self.is_awake = true;
    }

    pub fn put_to_sleep(&mut self) {
        self.is_awake = false;
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn set_active(&mut self) {
        self.is_active = true;
    }

    /// Forget everything learned during activation.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.ocr = None;
        self.cid = None;
        self.csd = None;
        self.memory_capacity = None;
        self.high_capacity = None;
        self.rca = Self::fixed_rca(self.device_type);
    }

    pub fn signal_removed_event(&self) {
        if let Some(event) = &self.removed_event {
            event.signal();
        }
    }

    pub fn clear_removed_event(&self) {
        if let Some(event) = &self.removed_event {
            event.clear();
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed_event
            .as_ref()
            .map_or(false, |event| event.is_signaled())
    }

    pub fn check_removed(&self) -> SdResult {
        if self.is_removed() {
            return Err(SdError::DeviceRemoved);
        }
        Ok(())
    }

    pub fn check_accessible(&self) -> SdResult {
        if !self.is_awake {
            return Err(SdError::NotAwakened);
        }
        if !self.is_active {
            return Err(SdError::NotActivated);
        }
        self.check_removed()
    }

    pub fn set_high_capacity(&mut self, high_capacity: bool) {
        self.high_capacity = Some(high_capacity);
    }

    pub fn is_high_capacity(&self) -> bool {
        match self.high_capacity {
            Some(v) => v,
            None => panic!("{:?}: capacity class is not known", self.device_type),
        }
    }

    pub fn set_ocr(&mut self, ocr: u32) {
        self.ocr = Some(ocr);
    }

    pub fn ocr(&self) -> u32 {
        match self.ocr {
            Some(v) => v,
            None => panic!("{:?}: OCR is not set", self.device_type),
        }
    }

    /// Store the CID from a raw R2 response.
    pub fn set_cid(&mut self, response: &[u32; 4]) {
        self.cid = Some(words_to_bytes(response));
    }

    pub fn cid(&self) -> [u8; CID_SIZE] {
        match self.cid {
            Some(v) => v,
            None => panic!("{:?}: CID is not set", self.device_type),
        }
    }

    /// Store the CSD from a raw R2 response.
    pub fn set_csd(&mut self, response: &[u32; 4]) {
        self.csd = Some(words_to_bytes(response));
    }

    pub fn csd(&self) -> [u8; CSD_SIZE] {
        match self.csd {
            Some(v) => v,
            None => panic!("{:?}: CSD is not set", self.device_type),
        }
    }

    /// 16-bit little-endian view of the stored CSD.
    pub fn csd_halfword(&self, index: usize) -> u16 {
        let csd = self.csd();
        u16::from_le_bytes([csd[index * 2], csd[index * 2 + 1]])
    }

    pub fn set_memory_capacity(&mut self, num_sectors: u32) {
        self.memory_capacity = Some(num_sectors);
    }

    pub fn memory_capacity(&self) -> u32 {
        match self.memory_capacity {
            Some(v) => v,
            None => panic!("{:?}: memory capacity is not set", self.device_type),
        }
    }

    pub fn set_rca(&mut self, rca: u16) {
        assert_eq!(self.device_type, DeviceType::SdCard, "only SD cards are addressed dynamically");
        self.rca = Some(rca);
    }

    pub fn rca(&self) -> u16 {
        match self.rca {
            Some(v) => v,
            None => panic!("{:?}: RCA is not assigned", self.device_type),
        }
    }

    /// (C_SIZE_MULT, READ_BL_LEN) of a byte-addressed CSD.
    pub fn legacy_capacity_parameters(&self) -> (u8, u8) {
        let c_size_mult = (self.csd_halfword(2) >> 7) & 0x7;
        let read_bl_len = (self.csd_halfword(4) >> 8) & 0xF;
        (c_size_mult as u8, read_bl_len as u8)
    }

    pub fn set_legacy_memory_capacity(&mut self) -> SdResult {
        let c_size = u32::from((self.csd_halfword(3) >> 6) & 0x3FF) | (u32::from(self.csd_halfword(4) & 0x3) << 10);
        let (c_size_mult, read_bl_len) = self.legacy_capacity_parameters();
        let shift = u32::from(read_bl_len) + u32::from(c_size_mult) + 2;
        if shift < 9 {
            return Err(SdError::UnexpectedDeviceCsdValue);
        }
        self.memory_capacity = Some((c_size + 1) << (shift - 9));
        Ok(())
    }

    /// Report the first error bit set in an R1 response.
    pub fn check_device_status(&self, status: u32) -> SdResult {
        let status = DeviceStatus::from_bits_truncate(status);
        if !status.intersects(DeviceStatus::ERROR_MASK) {
            return Ok(());
        }
        for &(bit, err) in STATUS_ERRORS.iter() {
            // SD cards reuse bit 7 for FX_EVENT
            if bit == DeviceStatus::SWITCH_ERROR && self.device_type != DeviceType::Mmc {
                continue;
            }
            if status.contains(bit) {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::AtomicEvent;

    #[test]
    fn state_comes_from_bits_9_to_12() {
        assert_eq!(DeviceState::from_status(4 << 9), DeviceState::Tran);
        assert_eq!(DeviceState::from_status((1 << 9) | (1 << 31)), DeviceState::Ready);
        assert_eq!(DeviceState::from_status(0), DeviceState::Idle);
        assert_eq!(DeviceState::from_status(15 << 9), DeviceState::Reserved(15));
    }

    #[test]
    fn status_errors_in_priority_order() {
        let mmc = Device::new(DeviceType::Mmc);
        assert_eq!(mmc.check_device_status(4 << 9), Ok(()));
        let both = (DeviceStatus::ADDRESS_OUT_OF_RANGE | DeviceStatus::COM_CRC_ERROR).bits();
        assert_eq!(mmc.check_device_status(both), Err(SdError::DeviceStatusComCrcError));
        let oor = DeviceStatus::ADDRESS_OUT_OF_RANGE | DeviceStatus::ILLEGAL_COMMAND;
        assert_eq!(mmc.check_device_status(oor.bits()), Err(SdError::DeviceStatusIllegalCommand));
        assert_eq!(
            mmc.check_device_status(DeviceStatus::SWITCH_ERROR.bits()),
            Err(SdError::DeviceStatusSwitchError)
        );
        // APP_CMD and AKE_SEQ_ERROR are informational here
        assert_eq!(mmc.check_device_status((DeviceStatus::APP_CMD | DeviceStatus::AKE_SEQ_ERROR).bits()), Ok(()));
    }

    #[test]
    fn switch_error_only_applies_to_mmc() {
        let sd = Device::new(DeviceType::SdCard);
        assert_eq!(sd.check_device_status(DeviceStatus::SWITCH_ERROR.bits()), Ok(()));
        let with_wp = DeviceStatus::SWITCH_ERROR | DeviceStatus::WP_VIOLATION;
        assert_eq!(sd.check_device_status(with_wp.bits()), Err(SdError::DeviceStatusWpViolation));
    }

    #[test]
    fn legacy_capacity_from_csd() {
        let mut dev = Device::new(DeviceType::Mmc);
        // C_SIZE 0xFFF, C_SIZE_MULT 7, READ_BL_LEN 9
        dev.set_csd(&[0, (0x3FF << 22) | (7 << 7), (9 << 8) | 3, 0]);
        assert_eq!(dev.legacy_capacity_parameters(), (7, 9));
        dev.set_legacy_memory_capacity().unwrap();
        assert_eq!(dev.memory_capacity(), 4096 << 9);

        dev.set_csd(&[0; 4]);
        assert_eq!(dev.set_legacy_memory_capacity(), Err(SdError::UnexpectedDeviceCsdValue));
    }

    #[test]
    fn cid_bytes_follow_response_words() {
        let mut dev = Device::new(DeviceType::Mmc);
        dev.set_cid(&[0x0403_0201, 0, 0, 0x0011_0000]);
        let cid = dev.cid();
        assert_eq!(&cid[..4], &[1, 2, 3, 4]);
        assert_eq!(cid[14], 0x11);
    }

    #[test]
    fn accessibility_checks() {
        let event = Arc::new(AtomicEvent::new());
        let mut dev = Device::new(DeviceType::SdCard).with_removed_event(event.clone());
        assert_eq!(dev.check_accessible(), Err(SdError::NotActivated));
        dev.set_active();
        assert_eq!(dev.check_accessible(), Ok(()));
        event.signal();
        assert_eq!(dev.check_accessible(), Err(SdError::DeviceRemoved));
        dev.clear_removed_event();
        dev.put_to_sleep();
        assert_eq!(dev.check_accessible(), Err(SdError::NotAwakened));
        dev.awaken();
        assert_eq!(dev.check_accessible(), Ok(()));
    }

    #[test]
    fn deactivate_forgets_identification() {
        let mut dev = Device::new(DeviceType::SdCard);
        dev.set_rca(0x1234);
        dev.set_ocr(0x8000_0000);
        dev.set_memory_capacity(10);
        dev.set_active();
        dev.deactivate();
        assert!(!dev.is_active());
        assert!(dev.is_awake());
        assert!(std::panic::catch_unwind(|| Device::new(DeviceType::SdCard).rca()).is_err());

        let mut mmc = Device::new(DeviceType::Mmc);
        mmc.deactivate();
        assert_eq!(mmc.rca(), MMC_RCA);
        assert_eq!(Device::new(DeviceType::GcAsic).rca(), 0);
    }

    #[test]
    #[should_panic]
    fn unset_capacity_aborts() {
        Device::new(DeviceType::Mmc).memory_capacity();
    }

    #[test]
    #[should_panic(expected = "CID is not set")]
    fn unset_cid_aborts() {
        Device::new(DeviceType::Mmc).cid();
    }

    #[test]
    #[should_panic(expected = "CSD is not set")]
    fn unset_csd_aborts() {
        Device::new(DeviceType::SdCard).csd();
    }

    #[test]
    #[should_panic(expected = "OCR is not set")]
    fn unset_ocr_aborts() {
        Device::new(DeviceType::Mmc).ocr();
    }

    #[test]
    #[should_panic(expected = "RCA is not assigned")]
    fn unassigned_rca_aborts() {
        Device::new(DeviceType::SdCard).rca();
    }

    #[test]
    #[should_panic(expected = "capacity class is not known")]
    fn unknown_capacity_class_aborts() {
        Device::new(DeviceType::SdCard).is_high_capacity();
    }

    #[test]
    #[should_panic(expected = "CSD is not set")]
    fn legacy_capacity_needs_a_csd() {
        let _ = Device::new(DeviceType::Mmc).set_legacy_memory_capacity();
    }
}

use core::fmt;

pub type SdResult<T = ()> = Result<T, SdError>;

/// Every failure the stack can report. Discriminants are stable and are what
/// the textual error log prints, so they are grouped by numeric range.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SdError {
    // Device presence
    NoDevice = 1,
    NotActivated = 2,
    DeviceRemoved = 3,
    NotAwakened = 4,

    // Communication not attained
    ResponseIndexError = 34,
    ResponseEndBitError = 35,
    ResponseCrcError = 36,
    ResponseTimeoutError = 37,
    DataEndBitError = 38,
    DataCrcError = 39,
    DataTimeoutError = 40,
    AutoCommandResponseIndexError = 41,
    AutoCommandResponseEndBitError = 42,
    AutoCommandResponseCrcError = 43,
    AutoCommandResponseTimeoutError = 44,
    CommandCompleteSoftwareTimeout = 45,
    TransferCompleteSoftwareTimeout = 46,

    // Device status has error
    DeviceStatusAddressOutOfRange = 49,
    DeviceStatusAddressMisaligned = 50,
    DeviceStatusBlockLenError = 51,
    DeviceStatusEraseSeqError = 52,
    DeviceStatusEraseParam = 53,
    DeviceStatusWpViolation = 54,
    DeviceStatusLockUnlockFailed = 55,
    DeviceStatusComCrcError = 56,
    DeviceStatusIllegalCommand = 57,
    DeviceStatusDeviceEccFailed = 58,
    DeviceStatusCcError = 59,
    DeviceStatusError = 60,
    DeviceStatusCidCsdOverwrite = 61,
    DeviceStatusWpEraseSkip = 62,
    DeviceStatusEraseReset = 63,
    DeviceStatusSwitchError = 64,

    // Other communication errors
    UnexpectedDeviceState = 71,
    UnexpectedDeviceCsdValue = 72,
    AbortTransactionSoftwareTimeout = 73,
    CommandInhibitCmdSoftwareTimeout = 74,
    CommandInhibitDatSoftwareTimeout = 75,
    BusySoftwareTimeout = 76,
    IssueTuningCommandSoftwareTimeout = 77,
    TuningFailed = 78,
    MmcInitializationSoftwareTimeout = 79,
    MmcNotSupportExtendedCsd = 80,
    UnexpectedMmcExtendedCsdValue = 81,
    MmcEraseSoftwareTimeout = 82,
    SdCardValidationError = 83,
    SdCardInitializationSoftwareTimeout = 84,
    SdCardGetValidRcaSoftwareTimeout = 85,
    UnexpectedSdCardAcmdDisabled = 86,
    SdCardNotSupportSwitchFunctionStatus = 87,
    UnexpectedSdCardSwitchFunctionStatus = 88,
    SdCardNotSupportAccessMode = 89,
    SdCardNot4BitBusWidthAtUhsIMode = 90,
    SdCardNotSupportSdr104AndSdr50 = 91,
    SdCardCannotSwitchAccessMode = 92,
    SdCardFailedSwitchAccessMode = 93,
    SdCardUnacceptableCurrentConsumption = 94,
    SdCardNotReadyToVoltageSwitch = 95,
    SdCardNotCompleteVoltageSwitch = 96,

    // Host controller unexpected
    InternalClockStableSoftwareTimeout = 129,
    SdHostStandardUnknownAutoCmdError = 130,
    SdHostStandardUnknownError = 131,
    SdmmcDllCalibrationSoftwareTimeout = 132,
    SdmmcDllApplicationSoftwareTimeout = 133,
    SdHostStandardFailSwitchTo1_8V = 134,
    DriveStrengthCalibrationNotCompleted = 135,
    DriveStrengthCalibrationSoftwareTimeout = 136,
    SdmmcCompShortToGnd = 137,
    SdmmcCompOpen = 138,

    // Internal
    NoWaitedInterrupt = 161,
    WaitInterruptSoftwareTimeout = 162,
    RegulatorAccessFailed = 170,
    PowerControlFailed = 171,
}

impl SdError {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// The controller never got a clean response or data phase.
    pub fn is_communication_not_attained(self) -> bool {
        (33..=46).contains(&self.code())
    }

    /// The device answered, but its R1 status carried an error bit.
    pub fn is_device_status_error(self) -> bool {
        (48..=70).contains(&self.code())
    }

    pub fn is_communication_error(self) -> bool {
        (32..=126).contains(&self.code())
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::SdError::*;
        let explain = match self {
            NoDevice => "No device",
            NotActivated => "Device not activated",
            DeviceRemoved => "Device removed",
            NotAwakened => "Device not awakened",
            ResponseIndexError => "Response index error",
            ResponseEndBitError => "Response end bit error",
            ResponseCrcError => "Response crc error",
            ResponseTimeoutError => "Response timeout",
            DataEndBitError => "Data end bit error",
            DataCrcError => "Data crc error",
            DataTimeoutError => "Data timeout",
            AutoCommandResponseIndexError => "Auto cmd response index error",
            AutoCommandResponseEndBitError => "Auto cmd response end bit error",
            AutoCommandResponseCrcError => "Auto cmd response crc error",
            AutoCommandResponseTimeoutError => "Auto cmd response timeout",
            CommandCompleteSoftwareTimeout => "Command complete timeout",
            TransferCompleteSoftwareTimeout => "Transfer complete timeout",
            DeviceStatusAddressOutOfRange => "Status: address out of range",
            DeviceStatusAddressMisaligned => "Status: address misaligned",
            DeviceStatusBlockLenError => "Status: block length error",
            DeviceStatusEraseSeqError => "Status: erase sequence error",
            DeviceStatusEraseParam => "Status: erase param",
            DeviceStatusWpViolation => "Status: write protect violation",
            DeviceStatusLockUnlockFailed => "Status: lock/unlock failed",
            DeviceStatusComCrcError => "Status: command crc error",
            DeviceStatusIllegalCommand => "Status: illegal command",
            DeviceStatusDeviceEccFailed => "Status: device ecc failed",
            DeviceStatusCcError => "Status: cc error",
            DeviceStatusError => "Status: error",
            DeviceStatusCidCsdOverwrite => "Status: cid/csd overwrite",
            DeviceStatusWpEraseSkip => "Status: wp erase skip",
            DeviceStatusEraseReset => "Status: erase reset",
            DeviceStatusSwitchError => "Status: switch error",
            UnexpectedDeviceState => "Unexpected device state",
            UnexpectedDeviceCsdValue => "Unexpected csd value",
            AbortTransactionSoftwareTimeout => "Abort transaction timeout",
            CommandInhibitCmdSoftwareTimeout => "Command inhibit (cmd) timeout",
            CommandInhibitDatSoftwareTimeout => "Command inhibit (dat) timeout",
            BusySoftwareTimeout => "Busy timeout",
            IssueTuningCommandSoftwareTimeout => "Tuning command timeout",
            TuningFailed => "Tuning failed",
            MmcInitializationSoftwareTimeout => "MMC initialization timeout",
            MmcNotSupportExtendedCsd => "MMC does not support extended csd",
            UnexpectedMmcExtendedCsdValue => "Unexpected extended csd value",
            MmcEraseSoftwareTimeout => "MMC erase timeout",
            SdCardValidationError => "SD card validation error",
            SdCardInitializationSoftwareTimeout => "SD card initialization timeout",
            SdCardGetValidRcaSoftwareTimeout => "SD card rca timeout",
            UnexpectedSdCardAcmdDisabled => "SD card app cmd disabled",
            SdCardNotSupportSwitchFunctionStatus => "SD card has no switch function",
            UnexpectedSdCardSwitchFunctionStatus => "Unexpected switch function status",
            SdCardNotSupportAccessMode => "SD card access mode unsupported",
            SdCardNot4BitBusWidthAtUhsIMode => "UHS-I requires a 4-bit bus",
            SdCardNotSupportSdr104AndSdr50 => "SD card supports neither SDR104 nor SDR50",
            SdCardCannotSwitchAccessMode => "SD card cannot switch access mode",
            SdCardFailedSwitchAccessMode => "SD card failed to switch access mode",
            SdCardUnacceptableCurrentConsumption => "SD card current consumption too high",
            SdCardNotReadyToVoltageSwitch => "SD card not ready to voltage switch",
            SdCardNotCompleteVoltageSwitch => "SD card did not complete voltage switch",
            InternalClockStableSoftwareTimeout => "Internal clock stable timeout",
            SdHostStandardUnknownAutoCmdError => "Unknown auto cmd error",
            SdHostStandardUnknownError => "Unknown host error",
            SdmmcDllCalibrationSoftwareTimeout => "DLL calibration timeout",
            SdmmcDllApplicationSoftwareTimeout => "DLL application timeout",
            SdHostStandardFailSwitchTo1_8V => "Failed to switch to 1.8V",
            DriveStrengthCalibrationNotCompleted => "Drive strength calibration not completed",
            DriveStrengthCalibrationSoftwareTimeout => "Drive strength calibration timeout",
            SdmmcCompShortToGnd => "Pad short to ground",
            SdmmcCompOpen => "Pad open",
            NoWaitedInterrupt => "No waited interrupt",
            WaitInterruptSoftwareTimeout => "Wait interrupt timeout",
            RegulatorAccessFailed => "Regulator access failed",
            PowerControlFailed => "Power control failed",
        };
        write!(f, "{}", explain)
    }
}

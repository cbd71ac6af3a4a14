use core::fmt;

use thiserror::Error;

use crate::cia402::{HomingStatus, OperationMode, State402};

pub type Result<T> = core::result::Result<T, Error>;

/// Direction of a rejected dictionary access.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Failures raised by a [`Transport`](crate::network::Transport).
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TransportError {
    /// The identifier does not fit in 29 bits.
    #[error("invalid CAN identifier {0:#x}")]
    InvalidId(u32),

    /// More than 8 data bytes were handed to a classic CAN frame.
    #[error("payload of {0} bytes does not fit in a CAN frame")]
    PayloadTooLong(usize),

    /// The underlying driver refused the frame.
    #[error("CAN bus error: {0}")]
    Bus(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The index (or subindex, when `sub_index` is set) does not exist.
    #[error("object {index:#06x}{} not found", fmt_sub(.sub_index))]
    NotFound { index: u16, sub_index: Option<u8> },

    /// Read of a write-only object or write of a read-only one.
    #[error("{access} access to {index:#06x}:{sub_index:02x} not allowed")]
    AccessViolation { index: u16, sub_index: u8, access: Access },

    /// Wire bytes and declared type width disagree.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Segmented transfer sequencing violation.
    #[error("toggle bit not alternated")]
    ToggleBitError,

    /// No response within the configured window.
    #[error("no SDO response received")]
    CommunicationTimeout,

    /// The peer aborted the transfer.
    #[error("SDO aborted with code {code:#010x} ({})", describe_abort(.code))]
    Aborted { code: u32 },

    /// A response arrived but does not belong to the running transfer.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A logical value cannot be represented by the target type.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("object {index:#06x} already exists")]
    DuplicateObject { index: u16 },

    #[error("PDO error: {0}")]
    Pdo(String),

    /// No heartbeat or boot-up message arrived in time.
    #[error("no boot-up or heartbeat received")]
    NoHeartbeat,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The CiA-402 state cannot be entered programmatically.
    #[error("target state {0} cannot be entered programmatically")]
    IllegalTarget(State402),

    #[error("timeout when trying to change state to {0}")]
    StateChangeTimeout(State402),

    #[error("operation mode {0} not supported")]
    UnsupportedMode(OperationMode),

    #[error("timeout setting operation mode to {0}")]
    OperationModeTimeout(OperationMode),

    #[error("unable to home: {0}")]
    HomingFailed(HomingStatus),

    #[error("unable to home, timeout reached")]
    HomingTimeout,
}

fn fmt_sub(sub_index: &Option<u8>) -> String {
    match sub_index {
        Some(sub) => format!(":{:02x}", sub),
        None => String::new(),
    }
}

fn describe_abort(code: &u32) -> &'static str {
    AbortCode::from_code(*code).map_or("unknown abort code", |c| c.description())
}

impl Error {
    /// Abort code sent on the wire when this error ends a served transfer.
    pub fn abort_code(&self) -> u32 {
        let code = match self {
            Error::NotFound { sub_index: None, .. } => AbortCode::ObjectDoesNotExistInObjectDictionary,
            Error::NotFound { sub_index: Some(_), .. } => AbortCode::SubIndexDoesNotExist,
            Error::AccessViolation { access: Access::Read, .. } => AbortCode::AttemptToReadWriteOnlyObject,
            Error::AccessViolation { access: Access::Write, .. } => AbortCode::AttemptToWriteReadOnlyObject,
            Error::SizeMismatch { .. } => AbortCode::DataTypeMismatchLengthMismatch,
            Error::ToggleBitError => AbortCode::ToggleBitNotAlternated,
            Error::CommunicationTimeout => AbortCode::SdoProtocolTimedOut,
            Error::Aborted { code } => return *code,
            Error::UnexpectedResponse(_) => AbortCode::CommandSpecifierNotValidOrUnknown,
            Error::InvalidValue(_) => AbortCode::ValueRangeExceeded,
            Error::Pdo(_) => AbortCode::ObjectCannotBeMappedToPDO,
            _ => AbortCode::GeneralError,
        };
        code.code()
    }
}

impl From<AbortCode> for Error {
    fn from(code: AbortCode) -> Self {
        Error::Aborted { code: code.code() }
    }
}

/// CiA-301 SDO abort codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    SdoProtocolTimedOut,
    CommandSpecifierNotValidOrUnknown,
    InvalidBlockSize,
    InvalidSequenceNumber,
    CRCError,
    OutOfMemory,
    UnsupportedAccessToObject,
    AttemptToReadWriteOnlyObject,
    AttemptToWriteReadOnlyObject,
    ObjectDoesNotExistInObjectDictionary,
    ObjectCannotBeMappedToPDO,
    ExceedPDOSize,
    GeneralParameterIncompatibility,
    GeneralInternalIncompatibility,
    HardwareError,
    DataTypeMismatchLengthMismatch,
    DataTypeMismatchLengthTooHigh,
    DataTypeMismatchLengthTooLow,
    SubIndexDoesNotExist,
    ValueRangeExceeded,
    ValueWrittenTooHigh,
    ValueWrittenTooLow,
    MaxValueLessThanMinValue,
    ResourceNotAvailable,
    GeneralError,
    DataTransferOrStoreFailed,
    DataTransferOrStoreFailedDueToLocalControl,
    DataTransferOrStoreFailedDueToDeviceState,
    ObjectDictionaryGenerationFailedOrNotPresent,
    NoDataAvailable,
}

impl AbortCode {
    pub fn code(&self) -> u32 {
        match *self {
            AbortCode::ToggleBitNotAlternated => 0x0503_0000,
            AbortCode::SdoProtocolTimedOut => 0x0504_0000,
            AbortCode::CommandSpecifierNotValidOrUnknown => 0x0504_0001,
            AbortCode::InvalidBlockSize => 0x0504_0002,
            AbortCode::InvalidSequenceNumber => 0x0504_0003,
            AbortCode::CRCError => 0x0504_0004,
            AbortCode::OutOfMemory => 0x0504_0005,
            AbortCode::UnsupportedAccessToObject => 0x0601_0000,
            AbortCode::AttemptToReadWriteOnlyObject => 0x0601_0001,
            AbortCode::AttemptToWriteReadOnlyObject => 0x0601_0002,
            AbortCode::ObjectDoesNotExistInObjectDictionary => 0x0602_0000,
            AbortCode::ObjectCannotBeMappedToPDO => 0x0604_0041,
            AbortCode::ExceedPDOSize => 0x0604_0042,
            AbortCode::GeneralParameterIncompatibility => 0x0604_0043,
            AbortCode::GeneralInternalIncompatibility => 0x0604_0047,
            AbortCode::HardwareError => 0x0606_0000,
            AbortCode::DataTypeMismatchLengthMismatch => 0x0607_0010,
            AbortCode::DataTypeMismatchLengthTooHigh => 0x0607_0012,
            AbortCode::DataTypeMismatchLengthTooLow => 0x0607_0013,
            AbortCode::SubIndexDoesNotExist => 0x0609_0011,
            AbortCode::ValueRangeExceeded => 0x0609_0030,
            AbortCode::ValueWrittenTooHigh => 0x0609_0031,
            AbortCode::ValueWrittenTooLow => 0x0609_0032,
            AbortCode::MaxValueLessThanMinValue => 0x0609_0036,
            AbortCode::ResourceNotAvailable => 0x060A_0023,
            AbortCode::GeneralError => 0x0800_0000,
            AbortCode::DataTransferOrStoreFailed => 0x0800_0020,
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => 0x0800_0021,
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => 0x0800_0022,
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => 0x0800_0023,
            AbortCode::NoDataAvailable => 0x0800_0024,
        }
    }

    pub fn description(&self) -> &'static str {
        match *self {
            AbortCode::ToggleBitNotAlternated => "Toggle bit not alternated",
            AbortCode::SdoProtocolTimedOut => "SDO protocol timed out",
            AbortCode::CommandSpecifierNotValidOrUnknown => "Client/server command specifier not valid or unknown",
            AbortCode::InvalidBlockSize => "Invalid block size (block mode only)",
            AbortCode::InvalidSequenceNumber => "Invalid sequence number (block mode only)",
            AbortCode::CRCError => "CRC error (block mode only)",
            AbortCode::OutOfMemory => "Out of memory",
            AbortCode::UnsupportedAccessToObject => "Unsupported access to an object",
            AbortCode::AttemptToReadWriteOnlyObject => "Attempt to read a write only object",
            AbortCode::AttemptToWriteReadOnlyObject => "Attempt to write a read only object",
            AbortCode::ObjectDoesNotExistInObjectDictionary => "Object does not exist in the object dictionary",
            AbortCode::ObjectCannotBeMappedToPDO => "Object cannot be mapped to the PDO",
            AbortCode::ExceedPDOSize => "The number and length of the objects to be mapped would exceed PDO length",
            AbortCode::GeneralParameterIncompatibility => "General parameter incompatibility reason",
            AbortCode::GeneralInternalIncompatibility => "General internal incompatibility in the device",
            AbortCode::HardwareError => "Access failed due to a hardware error",
            AbortCode::DataTypeMismatchLengthMismatch => "Data type does not match; length of service parameter does not match",
            AbortCode::DataTypeMismatchLengthTooHigh => "Data type does not match; length of service parameter too high",
            AbortCode::DataTypeMismatchLengthTooLow => "Data type does not match; length of service parameter too low",
            AbortCode::SubIndexDoesNotExist => "Sub-index does not exist",
            AbortCode::ValueRangeExceeded => "Value range of parameter exceeded (only for write access)",
            AbortCode::ValueWrittenTooHigh => "Value of parameter written too high",
            AbortCode::ValueWrittenTooLow => "Value of parameter written too low",
            AbortCode::MaxValueLessThanMinValue => "Maximum value is less than minimum value",
            AbortCode::ResourceNotAvailable => "Resource not available: SDO connection",
            AbortCode::GeneralError => "General error",
            AbortCode::DataTransferOrStoreFailed => "Data cannot be transferred or stored to the application",
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => "Data cannot be transferred or stored to the application because of local control",
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => "Data cannot be transferred or stored to the application because of the present device state",
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => "Object dictionary dynamic generation fails or no object dictionary is present",
            AbortCode::NoDataAvailable => "No data available",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0503_0000 => Some(AbortCode::ToggleBitNotAlternated),
            0x0504_0000 => Some(AbortCode::SdoProtocolTimedOut),
            0x0504_0001 => Some(AbortCode::CommandSpecifierNotValidOrUnknown),
            0x0504_0002 => Some(AbortCode::InvalidBlockSize),
            0x0504_0003 => Some(AbortCode::InvalidSequenceNumber),
            0x0504_0004 => Some(AbortCode::CRCError),
            0x0504_0005 => Some(AbortCode::OutOfMemory),
            0x0601_0000 => Some(AbortCode::UnsupportedAccessToObject),
            0x0601_0001 => Some(AbortCode::AttemptToReadWriteOnlyObject),
            0x0601_0002 => Some(AbortCode::AttemptToWriteReadOnlyObject),
            0x0602_0000 => Some(AbortCode::ObjectDoesNotExistInObjectDictionary),
            0x0604_0041 => Some(AbortCode::ObjectCannotBeMappedToPDO),
            0x0604_0042 => Some(AbortCode::ExceedPDOSize),
            0x0604_0043 => Some(AbortCode::GeneralParameterIncompatibility),
            0x0604_0047 => Some(AbortCode::GeneralInternalIncompatibility),
            0x0606_0000 => Some(AbortCode::HardwareError),
            0x0607_0010 => Some(AbortCode::DataTypeMismatchLengthMismatch),
            0x0607_0012 => Some(AbortCode::DataTypeMismatchLengthTooHigh),
            0x0607_0013 => Some(AbortCode::DataTypeMismatchLengthTooLow),
            0x0609_0011 => Some(AbortCode::SubIndexDoesNotExist),
            0x0609_0030 => Some(AbortCode::ValueRangeExceeded),
            0x0609_0031 => Some(AbortCode::ValueWrittenTooHigh),
            0x0609_0032 => Some(AbortCode::ValueWrittenTooLow),
            0x0609_0036 => Some(AbortCode::MaxValueLessThanMinValue),
            0x060A_0023 => Some(AbortCode::ResourceNotAvailable),
            0x0800_0000 => Some(AbortCode::GeneralError),
            0x0800_0020 => Some(AbortCode::DataTransferOrStoreFailed),
            0x0800_0021 => Some(AbortCode::DataTransferOrStoreFailedDueToLocalControl),
            0x0800_0022 => Some(AbortCode::DataTransferOrStoreFailedDueToDeviceState),
            0x0800_0023 => Some(AbortCode::ObjectDictionaryGenerationFailedOrNotPresent),
            0x0800_0024 => Some(AbortCode::NoDataAvailable),
            _ => None,
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} ({})", self.code(), self.description())
    }
}

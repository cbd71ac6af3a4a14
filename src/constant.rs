use core::ops::RangeInclusive;

/// Canopen Function code prefixes on COB_ID
pub const COB_FUNC_NMT: u32 = 0x000;
pub const COB_FUNC_SYNC: u32 = 0x080;
pub const COB_FUNC_EMCY: u32 = 0x080;
pub const COB_FUNC_TPDO_0: u32 = 0x180;
pub const COB_FUNC_RPDO_0: u32 = 0x200;
pub const COB_FUNC_TRANSMIT_SDO: u32 = 0x580;
pub const COB_FUNC_RECEIVE_SDO: u32 = 0x600;
pub const COB_FUNC_HEARTBEAT: u32 = 0x700;

/// CANOPEN Registers
pub const REG_DEVICE_TYPE: u16 = 0x1000;
pub const REG_ERROR: u16 = 0x1001;
pub const REG_PRE_DEFINED_ERROR: u16 = 0x1003;
pub const REG_STORE_PARAMETERS: u16 = 0x1010;
pub const REG_RESTORE_DEFAULT_PARAMETERS: u16 = 0x1011;
pub const REG_PRODUCER_HEARTBEAT_TIME: u16 = 0x1017;

pub const REG_RPDO_COMMUNICATION: u16 = 0x1400;
pub const REG_RPDO_MAPPING: u16 = 0x1600;
pub const REG_TPDO_COMMUNICATION: u16 = 0x1800;
pub const REG_TPDO_MAPPING: u16 = 0x1A00;

pub(crate) const COMMUNICATION_REGISTERS_RANGE: RangeInclusive<u16> = 0x1000..=0x1FFF;

/// Dummy mapping entries occupy the data type indices.
pub(crate) const DUMMY_OBJECTS_RANGE: RangeInclusive<u16> = 0x0001..=0x0007;

/// Highest number of PDOs per direction.
pub(crate) const MAX_PDO_COUNT: u16 = 512;
pub(crate) const MAX_PDO_MAPPING_LENGTH: usize = 64;

/// PDO communication parameter flags
pub(crate) const PDO_NOT_VALID: u32 = 1 << 31;
pub(crate) const RTR_NOT_ALLOWED: u32 = 1 << 30;
pub(crate) const COB_ID_MASK: u32 = 0x1FFF_FFFF;

/// Largest segmented download the SDO server buffers.
pub const SDO_MAX_DOWNLOAD_SIZE: usize = 0x10_0000;

/// Emergency Codes
pub const EMCY_PDO_NOT_PROCESSED: u16 = 0x8210;

/// Misc
pub const STORE_MAGIC_CODE: u32 = 0x65_76_61_73;
pub const RESET_MAGIC_CODE: u32 = 0x64_61_6F_6C;

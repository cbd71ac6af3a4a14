use bitfield_struct::bitfield;

/// Client command specifiers, already shifted into the top three bits.
pub const REQUEST_SEGMENT_DOWNLOAD: u8 = 0 << 5;
pub const REQUEST_DOWNLOAD: u8 = 1 << 5;
pub const REQUEST_UPLOAD: u8 = 2 << 5;
pub const REQUEST_SEGMENT_UPLOAD: u8 = 3 << 5;
pub const REQUEST_ABORTED: u8 = 4 << 5;
pub const REQUEST_BLOCK_UPLOAD: u8 = 5 << 5;
pub const REQUEST_BLOCK_DOWNLOAD: u8 = 6 << 5;

/// Server command specifiers.
pub const RESPONSE_SEGMENT_UPLOAD: u8 = 0 << 5;
pub const RESPONSE_SEGMENT_DOWNLOAD: u8 = 1 << 5;
pub const RESPONSE_UPLOAD: u8 = 2 << 5;
pub const RESPONSE_DOWNLOAD: u8 = 3 << 5;
pub const RESPONSE_ABORTED: u8 = 4 << 5;

pub const COMMAND_MASK: u8 = 0xE0;
pub const EXPEDITED: u8 = 0x02;
pub const SIZE_SPECIFIED: u8 = 0x01;
pub const TOGGLE_BIT: u8 = 0x10;
pub const NO_MORE_DATA: u8 = 0x01;

/// Command byte of an initiate upload / download frame.
///
/// Bit layout, most significant first: command specifier (3), reserved (1),
/// number of unused bytes among the 4 data bytes (2), expedited (1),
/// size indicated (1).
#[bitfield(u8, order = Msb)]
pub struct SdoInitiateCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(1)]
    _reserved_0: u8,

    /// Only meaningful when both `e` and `s` are set.
    #[bits(2)]
    pub n: u8,

    #[bits(1)]
    pub e: bool,

    #[bits(1)]
    pub s: bool,
}

impl SdoInitiateCmd {
    /// Number of payload bytes carried by an expedited frame.
    pub fn expedited_len(&self) -> usize {
        if self.s() {
            4 - self.n() as usize
        } else {
            4
        }
    }
}

/// Command byte of an upload / download segment frame.
///
/// Bit layout, most significant first: command specifier (3), toggle (1),
/// number of unused bytes among the 7 data bytes (3), no more segments (1).
#[bitfield(u8, order = Msb)]
pub struct SdoSegmentCmd {
    #[bits(3)]
    pub ccs: u8,

    #[bits(1)]
    pub t: u8,

    #[bits(3)]
    pub n: u8,

    #[bits(1)]
    pub c: bool,
}

impl SdoSegmentCmd {
    pub fn data_len(&self) -> usize {
        7 - self.n() as usize
    }
}

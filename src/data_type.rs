/// CiA-301 basic data types, tagged with their standard dictionary index.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum DataType {
    Boolean = 0x1,
    Integer8 = 0x2,
    Integer16 = 0x3,
    Integer32 = 0x4,
    Unsigned8 = 0x5,
    Unsigned16 = 0x6,
    Unsigned32 = 0x7,
    Real32 = 0x8,
    VisibleString = 0x9,
    OctetString = 0xA,
    UnicodeString = 0xB,
    Domain = 0xF,
    Integer24 = 0x10,
    Real64 = 0x11,
    Integer40 = 0x12,
    Integer48 = 0x13,
    Integer56 = 0x14,
    Integer64 = 0x15,
    Unsigned24 = 0x16,
    Unsigned40 = 0x18,
    Unsigned48 = 0x19,
    Unsigned56 = 0x1A,
    Unsigned64 = 0x1B,
}

impl DataType {
    pub fn from_code(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(DataType::Boolean),
            0x2 => Some(DataType::Integer8),
            0x3 => Some(DataType::Integer16),
            0x4 => Some(DataType::Integer32),
            0x5 => Some(DataType::Unsigned8),
            0x6 => Some(DataType::Unsigned16),
            0x7 => Some(DataType::Unsigned32),
            0x8 => Some(DataType::Real32),
            0x9 => Some(DataType::VisibleString),
            0xA => Some(DataType::OctetString),
            0xB => Some(DataType::UnicodeString),
            0xF => Some(DataType::Domain),
            0x10 => Some(DataType::Integer24),
            0x11 => Some(DataType::Real64),
            0x12 => Some(DataType::Integer40),
            0x13 => Some(DataType::Integer48),
            0x14 => Some(DataType::Integer56),
            0x15 => Some(DataType::Integer64),
            0x16 => Some(DataType::Unsigned24),
            0x18 => Some(DataType::Unsigned40),
            0x19 => Some(DataType::Unsigned48),
            0x1A => Some(DataType::Unsigned56),
            0x1B => Some(DataType::Unsigned64),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Size of the type in bytes, `None` for variable length types.
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Integer8 | DataType::Unsigned8 => Some(1),
            DataType::Integer16 | DataType::Unsigned16 => Some(2),
            DataType::Integer24 | DataType::Unsigned24 => Some(3),
            DataType::Integer32 | DataType::Unsigned32 | DataType::Real32 => Some(4),
            DataType::Integer40 | DataType::Unsigned40 => Some(5),
            DataType::Integer48 | DataType::Unsigned48 => Some(6),
            DataType::Integer56 | DataType::Unsigned56 => Some(7),
            DataType::Integer64 | DataType::Unsigned64 | DataType::Real64 => Some(8),
            DataType::VisibleString
            | DataType::OctetString
            | DataType::UnicodeString
            | DataType::Domain => None,
        }
    }

    /// Width in bits; variable length types report 0.
    pub fn bit_length(&self) -> usize {
        self.size().map_or(0, |s| s * 8)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            DataType::Integer8
                | DataType::Integer16
                | DataType::Integer24
                | DataType::Integer32
                | DataType::Integer40
                | DataType::Integer48
                | DataType::Integer56
                | DataType::Integer64
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DataType::Unsigned8
                | DataType::Unsigned16
                | DataType::Unsigned24
                | DataType::Unsigned32
                | DataType::Unsigned40
                | DataType::Unsigned48
                | DataType::Unsigned56
                | DataType::Unsigned64
        )
    }

    pub fn is_integer(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Real32 | DataType::Real64)
    }

    /// Integer, float and boolean types: fixed width, length checked on write.
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float() || *self == DataType::Boolean
    }

    pub fn is_variable_length(&self) -> bool {
        self.size().is_none()
    }

    pub(crate) fn default_value(&self) -> Vec<u8> {
        vec![0; self.size().unwrap_or(0)]
    }
}

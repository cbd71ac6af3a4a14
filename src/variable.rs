use core::str::FromStr;
use std::collections::BTreeMap;

use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::util::{le_bytes_to_u64, sign_extend};
use crate::value::Value;
use crate::warn;

/// Access rights of a dictionary entry.
///
/// `ReadWriteRead` and `ReadWriteWrite` are read/write entries that are
/// preferably mapped into TPDOs and RPDOs respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessType {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    ReadWriteRead,
    ReadWriteWrite,
    Const,
}

impl AccessType {
    pub fn is_readable(&self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, AccessType::ReadOnly | AccessType::Const)
    }
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Ok(AccessType::ReadOnly),
            "wo" => Ok(AccessType::WriteOnly),
            "rw" => Ok(AccessType::ReadWrite),
            "rwr" => Ok(AccessType::ReadWriteRead),
            "rww" => Ok(AccessType::ReadWriteWrite),
            "const" => Ok(AccessType::Const),
            other => Err(Error::InvalidValue(format!("unknown access type '{}'", other))),
        }
    }
}

/// A single typed entry of the object dictionary.
///
/// Built with [`Variable::new`] and the `with_*` methods, then added to a
/// [`Record`](crate::object_dictionary::Record),
/// [`Array`](crate::object_dictionary::Array) or directly to the
/// [`ObjectDictionary`](crate::object_dictionary::ObjectDictionary).
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub(crate) name: String,
    pub(crate) index: u16,
    pub(crate) sub_index: u8,
    data_type: DataType,
    access_type: AccessType,
    default: Option<Value>,
    parameter_value: Option<Value>,
    min: Option<Value>,
    max: Option<Value>,
    factor: f64,
    unit: String,
    description: String,
    value_descriptions: BTreeMap<i64, String>,
    bit_definitions: BTreeMap<String, Vec<u8>>,
    pdo_mappable: bool,
    relative: bool,
    storage_location: String,
}

impl Variable {
    pub fn new(name: impl Into<String>, index: u16, sub_index: u8, data_type: DataType) -> Self {
        Variable {
            name: name.into(),
            index,
            sub_index,
            data_type,
            access_type: AccessType::ReadWrite,
            default: None,
            parameter_value: None,
            min: None,
            max: None,
            factor: 1.0,
            unit: String::new(),
            description: String::new(),
            value_descriptions: BTreeMap::new(),
            bit_definitions: BTreeMap::new(),
            pdo_mappable: false,
            relative: false,
            storage_location: String::new(),
        }
    }

    pub fn with_access(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Value to be written to the device by a configuration download.
    pub fn with_parameter_value(mut self, value: impl Into<Value>) -> Self {
        self.parameter_value = Some(value.into());
        self
    }

    pub fn with_limits(mut self, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        self.min = Some(min.into());
        self.max = Some(max.into());
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_value_description(mut self, raw: i64, text: impl Into<String>) -> Self {
        self.value_descriptions.insert(raw, text.into());
        self
    }

    pub fn with_bit_definition(mut self, name: impl Into<String>, bits: Vec<u8>) -> Self {
        self.bit_definitions.insert(name.into(), bits);
        self
    }

    pub fn with_pdo_mappable(mut self, pdo_mappable: bool) -> Self {
        self.pdo_mappable = pdo_mappable;
        self
    }

    /// The default value is an offset to be added to the node id.
    pub fn with_relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    pub fn with_storage_location(mut self, location: impl Into<String>) -> Self {
        self.storage_location = location.into();
        self
    }
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn index(&self) -> u16 {
        self.index
    }
    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }
    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
    pub fn parameter_value(&self) -> Option<&Value> {
        self.parameter_value.as_ref()
    }
    pub fn min(&self) -> Option<&Value> {
        self.min.as_ref()
    }
    pub fn max(&self) -> Option<&Value> {
        self.max.as_ref()
    }
    pub fn factor(&self) -> f64 {
        self.factor
    }
    pub fn unit(&self) -> &str {
        &self.unit
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn value_descriptions(&self) -> &BTreeMap<i64, String> {
        &self.value_descriptions
    }
    pub fn bit_definitions(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.bit_definitions
    }
    pub fn pdo_mappable(&self) -> bool {
        self.pdo_mappable
    }
    pub fn relative(&self) -> bool {
        self.relative
    }
    pub fn storage_location(&self) -> &str {
        &self.storage_location
    }
    pub fn is_readable(&self) -> bool {
        self.access_type.is_readable()
    }
    pub fn is_writable(&self) -> bool {
        self.access_type.is_writable()
    }

    /// Bit length used when mapping the entry into a PDO.
    pub fn bit_length(&self) -> usize {
        self.data_type.size().map_or(8, |s| s * 8)
    }

    /// Default value with node-id-relative offsets resolved.
    pub fn default_for_node(&self, node_id: Option<u8>) -> Option<Value> {
        let default = self.default.clone()?;
        Some(self.offset_by_node(default, node_id))
    }

    /// Configured parameter value, else the default, resolved like
    /// [`default_for_node`](Self::default_for_node).
    pub fn value_for_node(&self, node_id: Option<u8>) -> Option<Value> {
        let value = self.parameter_value.clone().or_else(|| self.default.clone())?;
        Some(self.offset_by_node(value, node_id))
    }

    fn offset_by_node(&self, value: Value, node_id: Option<u8>) -> Value {
        match (self.relative, node_id) {
            (true, Some(id)) => match value {
                Value::Integer(v) => Value::Integer(v + id as i64),
                Value::Unsigned(v) => Value::Unsigned(v + id as u64),
                other => other,
            },
            _ => value,
        }
    }
}

/// Encoding and decoding between logical values and wire bytes.
impl Variable {
    pub fn encode_raw(&self, value: &Value) -> Result<Vec<u8>> {
        self.check_range(value);
        let dt = self.data_type;
        match dt {
            DataType::Boolean => {
                let b = value.as_bool().ok_or_else(|| self.type_error(value))?;
                Ok(vec![b as u8])
            }
            DataType::Real32 => {
                let v = value.as_f64().ok_or_else(|| self.type_error(value))?;
                Ok((v as f32).to_le_bytes().to_vec())
            }
            DataType::Real64 => {
                let v = value.as_f64().ok_or_else(|| self.type_error(value))?;
                Ok(v.to_le_bytes().to_vec())
            }
            DataType::VisibleString => match value {
                Value::String(s) if s.is_ascii() => Ok(s.as_bytes().to_vec()),
                Value::Bytes(b) => Ok(b.clone()),
                _ => Err(self.type_error(value)),
            },
            DataType::UnicodeString => match value {
                Value::String(s) => Ok(s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()),
                Value::Bytes(b) => Ok(b.clone()),
                _ => Err(self.type_error(value)),
            },
            DataType::OctetString | DataType::Domain => value
                .as_bytes()
                .map(|b| b.to_vec())
                .ok_or_else(|| self.type_error(value)),
            _ => {
                let bits = match *value {
                    Value::Integer(v) => v as u64,
                    Value::Unsigned(v) => v,
                    Value::Boolean(b) => b as u64,
                    _ => return Err(self.type_error(value)),
                };
                let size = dt.size().unwrap_or(8);
                if !self.fits_width(value) {
                    warn!("Value {} does not fit in {:?} of {:#06x}:{:02x}, truncated",
                        value, dt, self.index, self.sub_index);
                }
                Ok(bits.to_le_bytes()[..size].to_vec())
            }
        }
    }

    pub fn decode_raw(&self, data: &[u8]) -> Result<Value> {
        let dt = self.data_type;
        if let Some(size) = dt.size() {
            if data.len() != size {
                return Err(Error::SizeMismatch { expected: size, actual: data.len() });
            }
        }
        let value = match dt {
            DataType::Boolean => Value::Boolean(data[0] != 0),
            DataType::Real32 => Value::Real(f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64),
            DataType::Real64 => Value::Real(f64::from_bits(le_bytes_to_u64(data))),
            DataType::VisibleString => {
                Value::String(trim_nul(data).iter().filter(|b| b.is_ascii()).map(|&b| b as char).collect())
            }
            DataType::UnicodeString => {
                let units: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
                Value::String(String::from_utf16_lossy(&units).trim_end_matches('\0').to_string())
            }
            DataType::OctetString | DataType::Domain => Value::Bytes(data.to_vec()),
            t if t.is_signed() => Value::Integer(sign_extend(le_bytes_to_u64(data), data.len() * 8)),
            _ => Value::Unsigned(le_bytes_to_u64(data)),
        };
        Ok(value)
    }

    /// Scale a raw value to engineering units.
    pub fn decode_phys(&self, raw: &Value) -> Value {
        if self.data_type.is_integer() && self.factor != 1.0 {
            if let Some(v) = raw.as_f64() {
                return Value::Real(v * self.factor);
            }
        }
        raw.clone()
    }

    pub fn encode_phys(&self, phys: &Value) -> Result<Value> {
        if !self.data_type.is_integer() {
            return Ok(phys.clone());
        }
        let v = phys.as_f64().ok_or_else(|| self.type_error(phys))?;
        Ok(self.integer_value((v / self.factor).round() as i64))
    }

    pub fn decode_desc(&self, raw: &Value) -> Result<String> {
        let key = raw.as_i64().ok_or_else(|| self.type_error(raw))?;
        self.value_descriptions.get(&key).cloned().ok_or_else(|| {
            Error::InvalidValue(format!("no value description for {} in {}", key, self.name))
        })
    }

    pub fn encode_desc(&self, desc: &str) -> Result<Value> {
        self.value_descriptions
            .iter()
            .find(|(_, text)| text.as_str() == desc)
            .map(|(&raw, _)| self.integer_value(raw))
            .ok_or_else(|| Error::InvalidValue(format!("no value corresponds to '{}' in {}", desc, self.name)))
    }

    /// Extract the given bits of a raw value, right aligned.
    pub fn decode_bits(&self, raw: u64, bits: &[u8]) -> u64 {
        match bits.iter().min() {
            Some(&low) => (raw & bit_mask(bits)) >> low,
            None => 0,
        }
    }

    pub fn encode_bits(&self, original: u64, bits: &[u8], value: u64) -> u64 {
        match bits.iter().min() {
            Some(&low) => {
                let mask = bit_mask(bits);
                (original & !mask) | ((value << low) & mask)
            }
            None => original,
        }
    }

    fn integer_value(&self, v: i64) -> Value {
        if self.data_type.is_unsigned() && v >= 0 {
            Value::Unsigned(v as u64)
        } else {
            Value::Integer(v)
        }
    }

    fn fits_width(&self, value: &Value) -> bool {
        let width = self.data_type.bit_length();
        if width >= 64 {
            return !(self.data_type.is_unsigned() && matches!(*value, Value::Integer(v) if v < 0));
        }
        if self.data_type.is_signed() {
            let (min, max) = (-(1i64 << (width - 1)), (1i64 << (width - 1)) - 1);
            value.as_i64().map_or(false, |v| v >= min && v <= max)
        } else {
            value.as_u64().map_or(false, |v| v >> width == 0)
        }
    }

    fn check_range(&self, value: &Value) {
        let Some(v) = value.as_f64() else { return };
        if let Some(min) = self.min.as_ref().and_then(Value::as_f64) {
            if v < min {
                warn!("Value {} is too low for {} ({:#06x}:{:02x}), minimum is {}",
                    value, self.name, self.index, self.sub_index, min);
            }
        }
        if let Some(max) = self.max.as_ref().and_then(Value::as_f64) {
            if v > max {
                warn!("Value {} is too high for {} ({:#06x}:{:02x}), maximum is {}",
                    value, self.name, self.index, self.sub_index, max);
            }
        }
    }

    fn type_error(&self, value: &Value) -> Error {
        Error::InvalidValue(format!("{} cannot be encoded as {:?} for {}", value, self.data_type, self.name))
    }
}

fn bit_mask(bits: &[u8]) -> u64 {
    bits.iter().filter(|&&b| b < 64).fold(0u64, |mask, &b| mask | (1 << b))
}

fn trim_nul(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(data_type: DataType) -> Variable {
        Variable::new("Test", 0x2000, 0, data_type)
    }

    #[test]
    fn test_access_type() {
        assert_eq!("RO".parse::<AccessType>(), Ok(AccessType::ReadOnly));
        assert_eq!("rww".parse::<AccessType>(), Ok(AccessType::ReadWriteWrite));
        assert!("xx".parse::<AccessType>().is_err());
        assert!(AccessType::Const.is_readable());
        assert!(!AccessType::Const.is_writable());
        assert!(!AccessType::WriteOnly.is_readable());
    }

    #[test]
    fn test_integer_boundaries() {
        let v = var(DataType::Integer24);
        assert_eq!(v.encode_raw(&Value::Integer(-8388608)).unwrap(), vec![0x00, 0x00, 0x80]);
        assert_eq!(v.encode_raw(&Value::Integer(8388607)).unwrap(), vec![0xFF, 0xFF, 0x7F]);
        assert_eq!(v.decode_raw(&[0x00, 0x00, 0x80]).unwrap(), Value::Integer(-8388608));
        assert_eq!(v.decode_raw(&[0xFF, 0xFF, 0x7F]).unwrap(), Value::Integer(8388607));

        let v = var(DataType::Unsigned40);
        let raw = v.encode_raw(&Value::Unsigned(0xFF_FFFF_FFFF)).unwrap();
        assert_eq!(raw, vec![0xFF; 5]);
        assert_eq!(v.decode_raw(&raw).unwrap(), Value::Unsigned(0xFF_FFFF_FFFF));

        let v = var(DataType::Integer56);
        let min = -(1i64 << 55);
        assert_eq!(v.decode_raw(&v.encode_raw(&Value::Integer(min)).unwrap()).unwrap(), Value::Integer(min));

        let v = var(DataType::Integer64);
        let raw = v.encode_raw(&Value::Integer(i64::MIN)).unwrap();
        assert_eq!(v.decode_raw(&raw).unwrap(), Value::Integer(i64::MIN));
    }

    #[test]
    fn test_every_integer_width_roundtrips() {
        let signed = [
            (DataType::Integer8, 8),
            (DataType::Integer16, 16),
            (DataType::Integer24, 24),
            (DataType::Integer32, 32),
            (DataType::Integer40, 40),
            (DataType::Integer48, 48),
            (DataType::Integer56, 56),
            (DataType::Integer64, 64),
        ];
        for (dt, bits) in signed {
            let v = var(dt);
            let max = ((1u64 << (bits - 1)) - 1) as i64;
            let min = -max - 1;
            for n in [min, -1, 0, 1, max] {
                let raw = v.encode_raw(&Value::Integer(n)).unwrap();
                assert_eq!(raw.len(), bits / 8, "{:?}", dt);
                assert_eq!(v.decode_raw(&raw).unwrap(), Value::Integer(n), "{:?}", dt);
            }
        }

        let unsigned = [
            (DataType::Unsigned8, 8),
            (DataType::Unsigned16, 16),
            (DataType::Unsigned24, 24),
            (DataType::Unsigned32, 32),
            (DataType::Unsigned40, 40),
            (DataType::Unsigned48, 48),
            (DataType::Unsigned56, 56),
            (DataType::Unsigned64, 64),
        ];
        for (dt, bits) in unsigned {
            let v = var(dt);
            let max = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            for n in [0, 1, max] {
                let raw = v.encode_raw(&Value::Unsigned(n)).unwrap();
                assert_eq!(raw, n.to_le_bytes()[..bits / 8].to_vec(), "{:?}", dt);
                assert_eq!(v.decode_raw(&raw).unwrap(), Value::Unsigned(n), "{:?}", dt);
            }
        }

        let v = var(DataType::OctetString);
        let octets = vec![0x00, 0xFF, 0x10, 0x00];
        let raw = v.encode_raw(&Value::Bytes(octets.clone())).unwrap();
        assert_eq!(raw, octets);
        assert_eq!(v.decode_raw(&raw).unwrap(), Value::Bytes(octets));
    }

    #[test]
    fn test_float_and_bool() {
        let v = var(DataType::Real32);
        let raw = v.encode_raw(&Value::Real(-1.25)).unwrap();
        assert_eq!(raw, (-1.25f32).to_le_bytes().to_vec());
        assert_eq!(v.decode_raw(&raw).unwrap(), Value::Real(-1.25));

        let v = var(DataType::Real64);
        let raw = v.encode_raw(&Value::Real(1e300)).unwrap();
        assert_eq!(v.decode_raw(&raw).unwrap(), Value::Real(1e300));

        let v = var(DataType::Boolean);
        assert_eq!(v.encode_raw(&Value::Boolean(true)).unwrap(), vec![1]);
        assert_eq!(v.decode_raw(&[0]).unwrap(), Value::Boolean(false));
    }

    #[test]
    fn test_strings() {
        let v = var(DataType::VisibleString);
        assert_eq!(v.encode_raw(&Value::from("Device")).unwrap(), b"Device".to_vec());
        assert_eq!(v.decode_raw(b"Device\0\0").unwrap(), Value::from("Device"));
        assert!(v.encode_raw(&Value::from("Grüße")).is_err());

        let v = var(DataType::UnicodeString);
        let raw = v.encode_raw(&Value::from("µA")).unwrap();
        assert_eq!(raw, vec![0xB5, 0x00, 0x41, 0x00]);
        assert_eq!(v.decode_raw(&[0xB5, 0x00, 0x41, 0x00, 0x00, 0x00]).unwrap(), Value::from("µA"));

        let v = var(DataType::Domain);
        assert_eq!(v.encode_raw(&Value::Bytes(vec![1, 2, 3])).unwrap(), vec![1, 2, 3]);
        assert_eq!(v.decode_raw(&[9; 20]).unwrap(), Value::Bytes(vec![9; 20]));
    }

    #[test]
    fn test_size_mismatch() {
        let v = var(DataType::Unsigned16);
        assert_eq!(v.decode_raw(&[1, 2, 3]), Err(Error::SizeMismatch { expected: 2, actual: 3 }));
        assert!(v.encode_raw(&Value::from("text")).is_err());
    }

    #[test]
    fn test_out_of_range_is_not_fatal() {
        let v = var(DataType::Unsigned8).with_limits(10u8, 20u8);
        assert_eq!(v.encode_raw(&Value::Unsigned(30)).unwrap(), vec![30]);
        // Wider than the type: truncated to the wire width.
        assert_eq!(v.encode_raw(&Value::Unsigned(0x1FF)).unwrap(), vec![0xFF]);
    }

    #[test]
    fn test_phys() {
        let v = var(DataType::Integer16).with_factor(0.1);
        assert_eq!(v.decode_phys(&Value::Integer(125)), Value::Real(12.5));
        assert_eq!(v.encode_phys(&Value::Real(12.5)).unwrap(), Value::Integer(125));
        let v = var(DataType::Unsigned16).with_factor(0.5);
        assert_eq!(v.encode_phys(&Value::Real(3.0)).unwrap(), Value::Unsigned(6));
        let v = var(DataType::Unsigned8);
        assert_eq!(v.decode_phys(&Value::Unsigned(3)), Value::Unsigned(3));
    }

    #[test]
    fn test_desc_and_bits() {
        let v = var(DataType::Unsigned8)
            .with_value_description(0, "Off")
            .with_value_description(1, "On")
            .with_bit_definition("Fault", vec![3]);
        assert_eq!(v.decode_desc(&Value::Unsigned(1)).unwrap(), "On");
        assert_eq!(v.encode_desc("Off").unwrap(), Value::Unsigned(0));
        assert!(v.encode_desc("Maybe").is_err());

        assert_eq!(v.decode_bits(0b1010_1000, &[3]), 1);
        assert_eq!(v.decode_bits(0b1010_1000, &[4, 5, 6, 7]), 0b1010);
        assert_eq!(v.encode_bits(0b1111_0000, &[0, 1], 0b11), 0b1111_0011);
        assert_eq!(v.encode_bits(0b1111_0000, &[4], 0), 0b1110_0000);
    }

    #[test]
    fn test_relative_default() {
        let v = Variable::new("COB-ID", 0x1800, 1, DataType::Unsigned32)
            .with_default(0x180u32)
            .with_relative(true);
        assert_eq!(v.default_for_node(Some(5)), Some(Value::Unsigned(0x185)));
        assert_eq!(v.default_for_node(None), Some(Value::Unsigned(0x180)));
    }
}

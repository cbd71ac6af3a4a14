use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::constant::DUMMY_OBJECTS_RANGE;
use crate::data_type::DataType;
use crate::error::{Error, Result};
use crate::prelude::*;
use crate::value::Value;
use crate::variable::{AccessType, Variable};

/// Accessors shared by every kind of dictionary object.
pub trait Object {
    fn index(&self) -> u16;
    fn name(&self) -> &str;
    /// Resolve a subindex to its variable, synthesizing it when the object allows.
    fn variable(&self, sub_index: u8) -> Option<Cow<'_, Variable>>;
}

fn add_member_to_container(
    name_to_index: &mut HashMap<String, u8>,
    index_to_variable: &mut BTreeMap<u8, Variable>,
    var: Variable,
) {
    name_to_index.insert(var.name.clone(), var.sub_index);
    index_to_variable.insert(var.sub_index, var);
}

/// Heterogeneous group of variables addressed by subindex.
#[derive(Clone, Debug)]
pub struct Record {
    name: String,
    index: u16,
    index_to_variable: BTreeMap<u8, Variable>,
    name_to_index: HashMap<String, u8>,
}

impl Record {
    pub fn new(name: impl Into<String>, index: u16) -> Self {
        Record {
            name: name.into(),
            index,
            index_to_variable: BTreeMap::new(),
            name_to_index: HashMap::new(),
        }
    }

    /// Add a member; its index is forced to the record's index.
    pub fn add_member(&mut self, mut var: Variable) {
        var.index = self.index;
        add_member_to_container(&mut self.name_to_index, &mut self.index_to_variable, var);
    }

    pub fn with_member(mut self, var: Variable) -> Self {
        self.add_member(var);
        self
    }

    pub fn get_variable_by_name(&self, name: &str) -> Option<&Variable> {
        self.name_to_index.get(name).and_then(|sub| self.index_to_variable.get(sub))
    }

    pub fn members(&self) -> impl Iterator<Item = &Variable> {
        self.index_to_variable.values()
    }
}

impl Object for Record {
    fn index(&self) -> u16 {
        self.index
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn variable(&self, sub_index: u8) -> Option<Cow<'_, Variable>> {
        self.index_to_variable.get(&sub_index).map(Cow::Borrowed)
    }
}

/// Homogeneous variables; subindex 0 holds the number of entries.
#[derive(Clone, Debug)]
pub struct Array {
    name: String,
    index: u16,
    index_to_variable: BTreeMap<u8, Variable>,
    name_to_index: HashMap<String, u8>,
}

impl Array {
    pub fn new(name: impl Into<String>, index: u16) -> Self {
        Array {
            name: name.into(),
            index,
            index_to_variable: BTreeMap::new(),
            name_to_index: HashMap::new(),
        }
    }

    pub fn add_member(&mut self, mut var: Variable) {
        var.index = self.index;
        add_member_to_container(&mut self.name_to_index, &mut self.index_to_variable, var);
    }

    pub fn with_member(mut self, var: Variable) -> Self {
        self.add_member(var);
        self
    }

    pub fn get_variable_by_name(&self, name: &str) -> Option<Cow<'_, Variable>> {
        if let Some(sub) = self.name_to_index.get(name) {
            return self.index_to_variable.get(sub).map(Cow::Borrowed);
        }
        // Synthesized members are named "<array>_<sub in hex>".
        let suffix = name.strip_prefix(self.name.as_str())?.strip_prefix('_')?;
        let sub = u8::from_str_radix(suffix, 16).ok()?;
        self.variable(sub)
    }

    pub fn members(&self) -> impl Iterator<Item = &Variable> {
        self.index_to_variable.values()
    }
}

impl Object for Array {
    fn index(&self) -> u16 {
        self.index
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn variable(&self, sub_index: u8) -> Option<Cow<'_, Variable>> {
        if let Some(var) = self.index_to_variable.get(&sub_index) {
            return Some(Cow::Borrowed(var));
        }
        if 0 < sub_index && sub_index < 0xFF {
            // Compact array: entries share the definition of subindex 1.
            let template = self.index_to_variable.get(&1)?;
            let mut var = template.clone();
            var.name = format!("{}_{:x}", self.name, sub_index);
            var.sub_index = sub_index;
            return Some(Cow::Owned(var));
        }
        None
    }
}

impl Object for Variable {
    fn index(&self) -> u16 {
        self.index
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn variable(&self, sub_index: u8) -> Option<Cow<'_, Variable>> {
        (sub_index == 0).then_some(Cow::Borrowed(self))
    }
}

#[derive(Clone, Debug)]
pub enum ObjectType {
    Variable(Variable),
    Array(Array),
    Record(Record),
}

impl ObjectType {
    fn as_object(&self) -> &dyn Object {
        match self {
            ObjectType::Variable(var) => var,
            ObjectType::Array(arr) => arr,
            ObjectType::Record(rec) => rec,
        }
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            ObjectType::Variable(var) => Some(var),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            ObjectType::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            ObjectType::Record(rec) => Some(rec),
            _ => None,
        }
    }

    /// Every explicitly defined variable of the object.
    pub fn members(&self) -> Vec<&Variable> {
        match self {
            ObjectType::Variable(var) => vec![var],
            ObjectType::Array(arr) => arr.members().collect(),
            ObjectType::Record(rec) => rec.members().collect(),
        }
    }
}

impl Object for ObjectType {
    fn index(&self) -> u16 {
        self.as_object().index()
    }
    fn name(&self) -> &str {
        self.as_object().name()
    }
    fn variable(&self, sub_index: u8) -> Option<Cow<'_, Variable>> {
        self.as_object().variable(sub_index)
    }
}

impl From<Variable> for ObjectType {
    fn from(var: Variable) -> Self {
        ObjectType::Variable(var)
    }
}

impl From<Array> for ObjectType {
    fn from(arr: Array) -> Self {
        ObjectType::Array(arr)
    }
}

impl From<Record> for ObjectType {
    fn from(rec: Record) -> Self {
        ObjectType::Record(rec)
    }
}

/// Typed table of a node's objects, addressed by index and subindex.
///
/// Built once, then shared read-only between the protocol services, usually
/// behind an `Arc`. Runtime values are kept by the node, not here.
#[derive(Clone, Debug, Default)]
pub struct ObjectDictionary {
    node_id: Option<u8>,
    bitrate: Option<u32>,
    index_to_object: BTreeMap<u16, ObjectType>,
    name_to_index: HashMap<String, u16>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn node_id(&self) -> Option<u8> {
        self.node_id
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.bitrate
    }

    pub fn add_object(&mut self, obj: impl Into<ObjectType>) -> Result<()> {
        let obj = obj.into();
        let index = obj.index();
        if self.index_to_object.contains_key(&index) {
            return Err(Error::DuplicateObject { index });
        }
        self.name_to_index.insert(obj.name().to_string(), index);
        self.index_to_object.insert(index, obj);
        Ok(())
    }

    pub fn with_object(mut self, obj: impl Into<ObjectType>) -> Result<Self> {
        self.add_object(obj)?;
        Ok(self)
    }

    pub fn get(&self, index: u16) -> Option<&ObjectType> {
        self.index_to_object.get(&index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ObjectType> {
        self.name_to_index.get(name).and_then(|index| self.index_to_object.get(index))
    }

    pub fn contains(&self, index: u16) -> bool {
        self.index_to_object.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.index_to_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_object.is_empty()
    }

    /// Objects in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectType> {
        self.index_to_object.values()
    }

    pub fn variable(&self, index: u16, sub_index: u8) -> Result<Cow<'_, Variable>> {
        match self.index_to_object.get(&index) {
            Some(obj) => obj
                .variable(sub_index)
                .ok_or(Error::NotFound { index, sub_index: Some(sub_index) }),
            None if DUMMY_OBJECTS_RANGE.contains(&index) => {
                let data_type = DataType::from_code(index).ok_or(Error::NotFound { index, sub_index: None })?;
                let var = Variable::new(format!("Dummy{:04x}", index), index, sub_index, data_type)
                    .with_access(AccessType::ReadWrite)
                    .with_pdo_mappable(true);
                Ok(Cow::Owned(var))
            }
            None => Err(Error::NotFound { index, sub_index: None }),
        }
    }

    /// Look up "Object" or "Object.Member" by name.
    pub fn variable_by_name(&self, path: &str) -> Result<Cow<'_, Variable>> {
        let not_found = || Error::InvalidValue(format!("no object named '{}'", path));
        let (object_name, member) = match path.split_once('.') {
            Some((object_name, member)) => (object_name, Some(member)),
            None => (path, None),
        };
        let obj = self.get_by_name(object_name).ok_or_else(not_found)?;
        match (obj, member) {
            (ObjectType::Variable(var), None) => Ok(Cow::Borrowed(var)),
            (ObjectType::Record(rec), Some(m)) => rec.get_variable_by_name(m).map(Cow::Borrowed).ok_or_else(not_found),
            (ObjectType::Array(arr), Some(m)) => arr.get_variable_by_name(m).ok_or_else(not_found),
            _ => Err(not_found()),
        }
    }
}

/// Raw and typed access to a dictionary, local or over SDO.
pub trait DictionaryAccess: Send + Sync {
    fn dictionary(&self) -> &ObjectDictionary;
    fn read_raw(&self, index: u16, sub_index: u8) -> Result<Vec<u8>>;
    fn write_raw(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<()>;

    fn read_value(&self, index: u16, sub_index: u8) -> Result<Value> {
        let var = self.dictionary().variable(index, sub_index)?;
        let data = self.read_raw(index, sub_index)?;
        var.decode_raw(&data)
    }

    fn write_value(&self, index: u16, sub_index: u8, value: Value) -> Result<()> {
        let var = self.dictionary().variable(index, sub_index)?;
        let data = var.encode_raw(&value)?;
        self.write_raw(index, sub_index, &data)
    }

    /// Value scaled by the variable's factor.
    fn read_phys(&self, index: u16, sub_index: u8) -> Result<Value> {
        let var = self.dictionary().variable(index, sub_index)?;
        let raw = var.decode_raw(&self.read_raw(index, sub_index)?)?;
        Ok(var.decode_phys(&raw))
    }

    fn write_phys(&self, index: u16, sub_index: u8, value: Value) -> Result<()> {
        let var = self.dictionary().variable(index, sub_index)?;
        let raw = var.encode_phys(&value)?;
        self.write_raw(index, sub_index, &var.encode_raw(&raw)?)
    }

    fn read_desc(&self, index: u16, sub_index: u8) -> Result<String> {
        let var = self.dictionary().variable(index, sub_index)?;
        let raw = var.decode_raw(&self.read_raw(index, sub_index)?)?;
        var.decode_desc(&raw)
    }

    fn write_desc(&self, index: u16, sub_index: u8, desc: &str) -> Result<()> {
        let var = self.dictionary().variable(index, sub_index)?;
        let raw = var.encode_desc(desc)?;
        self.write_raw(index, sub_index, &var.encode_raw(&raw)?)
    }

    /// Read by "Object" or "Object.Member" name.
    fn read_value_by_name(&self, path: &str) -> Result<Value> {
        let (index, sub_index) = {
            let var = self.dictionary().variable_by_name(path)?;
            (var.index(), var.sub_index())
        };
        self.read_value(index, sub_index)
    }

    fn write_value_by_name(&self, path: &str, value: Value) -> Result<()> {
        let (index, sub_index) = {
            let var = self.dictionary().variable_by_name(path)?;
            (var.index(), var.sub_index())
        };
        self.write_value(index, sub_index, value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_dictionary() -> ObjectDictionary {
        let mut od = ObjectDictionary::new().with_node_id(2);
        od.add_object(
            Variable::new("Device type", 0x1000, 0, DataType::Unsigned32)
                .with_access(AccessType::ReadOnly)
                .with_default(0x0002_0192u32),
        )
        .unwrap();
        od.add_object(
            Record::new("Identity object", 0x1018)
                .with_member(Variable::new("Number of entries", 0, 0, DataType::Unsigned8)
                    .with_access(AccessType::Const).with_default(4u8))
                .with_member(Variable::new("Vendor-ID", 0, 1, DataType::Unsigned32)
                    .with_access(AccessType::ReadOnly).with_default(0x0000_0360u32)),
        )
        .unwrap();
        od.add_object(
            Array::new("Error field", 0x1003)
                .with_member(Variable::new("Number of errors", 0, 0, DataType::Unsigned8).with_default(0u8))
                .with_member(Variable::new("Standard error field", 0, 1, DataType::Unsigned32)
                    .with_access(AccessType::ReadOnly)),
        )
        .unwrap();
        od
    }

    #[test]
    fn test_get_variable() {
        let od = sample_dictionary();
        let var = od.variable(0x1000, 0).unwrap();
        assert_eq!(var.name(), "Device type");
        assert_eq!(var.default(), Some(&Value::Unsigned(0x0002_0192)));

        let vendor = od.variable(0x1018, 1).unwrap();
        assert_eq!(vendor.index(), 0x1018);
        assert_eq!(vendor.name(), "Vendor-ID");
    }

    #[test]
    fn test_not_found() {
        let od = sample_dictionary();
        assert_eq!(od.variable(0x2000, 0).err(), Some(Error::NotFound { index: 0x2000, sub_index: None }));
        assert_eq!(od.variable(0x1018, 9).err(), Some(Error::NotFound { index: 0x1018, sub_index: Some(9) }));
        assert_eq!(od.variable(0x1000, 1).err(), Some(Error::NotFound { index: 0x1000, sub_index: Some(1) }));
    }

    #[test]
    fn test_compact_array() {
        let od = sample_dictionary();
        let var = od.variable(0x1003, 5).unwrap();
        assert_eq!(var.name(), "Error field_5");
        assert_eq!(var.sub_index(), 5);
        assert_eq!(var.data_type(), DataType::Unsigned32);
        assert!(matches!(var, Cow::Owned(_)));
        assert!(od.variable(0x1003, 0xFF).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        let od = sample_dictionary();
        assert_eq!(od.variable_by_name("Device type").unwrap().index(), 0x1000);
        assert_eq!(od.variable_by_name("Identity object.Vendor-ID").unwrap().sub_index(), 1);
        assert_eq!(od.variable_by_name("Error field.Error field_a").unwrap().sub_index(), 0xA);
        assert!(od.variable_by_name("Identity object").is_err());
        assert!(od.variable_by_name("Nope").is_err());
    }

    #[test]
    fn test_duplicate_and_dummy() {
        let mut od = sample_dictionary();
        let dup = od.add_object(Variable::new("Again", 0x1000, 0, DataType::Unsigned8));
        assert_eq!(dup, Err(Error::DuplicateObject { index: 0x1000 }));
        assert_eq!(od.len(), 3);

        let dummy = od.variable(0x0005, 0).unwrap();
        assert_eq!(dummy.data_type(), DataType::Unsigned8);
        assert!(od.variable(0x0009, 0).is_err());
    }

    #[test]
    fn test_iteration_order() {
        let od = sample_dictionary();
        let indices: Vec<u16> = od.iter().map(|o| o.index()).collect();
        assert_eq!(indices, vec![0x1000, 0x1003, 0x1018]);
    }
}

//! Dynamically typed property values
//!
//! An object's tagged state is an ordered list of [`PropertyTag`]s, each
//! carrying a closed [`PropertyValue`]. Values the engine cannot interpret
//! (unknown types, arrays without an element hint) are kept as raw bytes so
//! a re-save reproduces them unchanged.

mod hints;
mod tag;

pub use hints::{lookup as lookup_hint, ElementHint, HintTable, ValueKind, OBJECT_HINTS};
pub use tag::{read_tags, write_tags, TagReader, TagVisitor};

use crate::directory::PackageIndex;
use crate::name::{Name, NameTable};
use serde_json::{json, Value};

/// Declared type of a property tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Int,
    Float,
    Bool,
    Byte,
    Name,
    Str,
    Object,
    Component,
    Class,
    Interface,
    Delegate,
    Struct,
    Array,
    Map,
    QWord,
    Unknown,
}

impl PropertyType {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "IntProperty" => PropertyType::Int,
            "FloatProperty" => PropertyType::Float,
            "BoolProperty" => PropertyType::Bool,
            "ByteProperty" => PropertyType::Byte,
            "NameProperty" => PropertyType::Name,
            "StrProperty" => PropertyType::Str,
            "ObjectProperty" => PropertyType::Object,
            "ComponentProperty" => PropertyType::Component,
            "ClassProperty" => PropertyType::Class,
            "InterfaceProperty" => PropertyType::Interface,
            "DelegateProperty" => PropertyType::Delegate,
            "StructProperty" => PropertyType::Struct,
            "ArrayProperty" => PropertyType::Array,
            "MapProperty" => PropertyType::Map,
            "QWordProperty" => PropertyType::QWord,
            _ => PropertyType::Unknown,
        }
    }

    pub fn type_name(self) -> Option<&'static str> {
        Some(match self {
            PropertyType::Int => "IntProperty",
            PropertyType::Float => "FloatProperty",
            PropertyType::Bool => "BoolProperty",
            PropertyType::Byte => "ByteProperty",
            PropertyType::Name => "NameProperty",
            PropertyType::Str => "StrProperty",
            PropertyType::Object => "ObjectProperty",
            PropertyType::Component => "ComponentProperty",
            PropertyType::Class => "ClassProperty",
            PropertyType::Interface => "InterfaceProperty",
            PropertyType::Delegate => "DelegateProperty",
            PropertyType::Struct => "StructProperty",
            PropertyType::Array => "ArrayProperty",
            PropertyType::Map => "MapProperty",
            PropertyType::QWord => "QWordProperty",
            PropertyType::Unknown => return None,
        })
    }

    pub fn is_object_ref(self) -> bool {
        matches!(
            self,
            PropertyType::Object
                | PropertyType::Component
                | PropertyType::Class
                | PropertyType::Interface
        )
    }
}

/// Fixed-layout engine structs serialized without tags
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeStruct {
    Vector([f32; 3]),
    Vector2D([f32; 2]),
    Vector4([f32; 4]),
    Rotator([i32; 3]),
    /// Stored B, G, R, A
    Color([u8; 4]),
    LinearColor([f32; 4]),
    Guid([u8; 16]),
    Quat([f32; 4]),
    Plane([f32; 4]),
    Box {
        min: [f32; 3],
        max: [f32; 3],
        is_valid: u8,
    },
    IntPoint([i32; 2]),
}

impl NativeStruct {
    /// Encoded size of a native struct, `None` for tagged structs
    pub fn encoded_size(struct_name: &str) -> Option<usize> {
        Some(match struct_name {
            "Vector" => 12,
            "Vector2D" => 8,
            "Vector4" | "LinearColor" | "Guid" | "Quat" | "Plane" => 16,
            "Rotator" => 12,
            "Color" => 4,
            "Box" => 25,
            "IntPoint" => 8,
            _ => return None,
        })
    }

    fn to_json(&self) -> Value {
        match self {
            NativeStruct::Vector(v) => json!({ "x": v[0], "y": v[1], "z": v[2] }),
            NativeStruct::Vector2D(v) => json!({ "x": v[0], "y": v[1] }),
            NativeStruct::Vector4(v) | NativeStruct::Quat(v) | NativeStruct::Plane(v) => {
                json!({ "x": v[0], "y": v[1], "z": v[2], "w": v[3] })
            }
            NativeStruct::Rotator(r) => json!({ "pitch": r[0], "yaw": r[1], "roll": r[2] }),
            NativeStruct::Color(c) => json!({ "b": c[0], "g": c[1], "r": c[2], "a": c[3] }),
            NativeStruct::LinearColor(c) => json!({ "r": c[0], "g": c[1], "b": c[2], "a": c[3] }),
            NativeStruct::Guid(g) => json!(g.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
            NativeStruct::Box { min, max, is_valid } => {
                json!({ "min": min, "max": max, "valid": *is_valid != 0 })
            }
            NativeStruct::IntPoint(p) => json!({ "x": p[0], "y": p[1] }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructValue {
    Native(NativeStruct),
    Tagged(Vec<PropertyTag>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    Byte(u8),
    /// Byte property holding an enum value name
    Enum(Name),
    Name(Name),
    Str(String),
    Object(PackageIndex),
    Delegate {
        object: PackageIndex,
        function: Name,
    },
    Struct(StructValue),
    Array(Vec<PropertyValue>),
    /// Array whose element kind is unknown
    RawArray { count: i32, data: Vec<u8> },
    Map(Vec<(PropertyValue, PropertyValue)>),
    /// Map whose key/value kinds are unknown
    RawMap { count: i32, data: Vec<u8> },
    QWord(u64),
    Raw(Vec<u8>),
}

impl PropertyValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<Name> {
        match self {
            PropertyValue::Name(n) | PropertyValue::Enum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<PackageIndex> {
        match self {
            PropertyValue::Object(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Every non-null object reference held by this value, depth first
    pub fn object_refs(&self, out: &mut Vec<PackageIndex>) {
        match self {
            PropertyValue::Object(i) | PropertyValue::Delegate { object: i, .. } => {
                if !i.is_null() {
                    out.push(*i);
                }
            }
            PropertyValue::Struct(StructValue::Tagged(tags)) => {
                tags.iter().for_each(|t| t.value.object_refs(out))
            }
            PropertyValue::Array(items) => items.iter().for_each(|v| v.object_refs(out)),
            PropertyValue::Map(pairs) => pairs.iter().for_each(|(k, v)| {
                k.object_refs(out);
                v.object_refs(out);
            }),
            _ => {}
        }
    }

    /// JSON view; object references are rendered through `object`
    pub fn to_json(&self, names: &NameTable, object: &dyn Fn(PackageIndex) -> String) -> Value {
        let name = |n: &Name| json!(names.display(*n).unwrap_or_else(|_| "<invalid>".into()));
        match self {
            PropertyValue::Int(v) => json!(v),
            PropertyValue::Float(v) => json!(v),
            PropertyValue::Bool(v) => json!(v),
            PropertyValue::Byte(v) => json!(v),
            PropertyValue::Enum(n) | PropertyValue::Name(n) => name(n),
            PropertyValue::Str(s) => json!(s),
            PropertyValue::Object(i) => json!(object(*i)),
            PropertyValue::Delegate { object: i, function } => {
                json!({ "object": object(*i), "function": name(function) })
            }
            PropertyValue::Struct(StructValue::Native(s)) => s.to_json(),
            PropertyValue::Struct(StructValue::Tagged(tags)) => tags_to_json(tags, names, object),
            PropertyValue::Array(items) => {
                Value::Array(items.iter().map(|v| v.to_json(names, object)).collect())
            }
            PropertyValue::Map(pairs) => Value::Array(
                pairs
                    .iter()
                    .map(|(k, v)| json!([k.to_json(names, object), v.to_json(names, object)]))
                    .collect(),
            ),
            PropertyValue::RawArray { count, data } | PropertyValue::RawMap { count, data } => {
                json!({ "count": count, "raw_bytes": data.len() })
            }
            PropertyValue::QWord(v) => json!(v),
            PropertyValue::Raw(data) => json!({ "raw_bytes": data.len() }),
        }
    }
}

/// One named, typed property with its value
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyTag {
    pub name: Name,
    pub type_name: Name,
    pub property_type: PropertyType,
    /// Struct type for `StructProperty`
    pub struct_name: Option<Name>,
    /// Enum type for modern `ByteProperty`
    pub enum_name: Option<Name>,
    pub array_index: i32,
    /// Declared value size as read; recomputed on write
    pub size: i32,
    pub value: PropertyValue,
}

impl PropertyTag {
    /// Build a tag, interning the name and type name
    pub fn new(names: &mut NameTable, name: &str, property_type: PropertyType, value: PropertyValue) -> Self {
        let type_name = names.intern(property_type.type_name().unwrap_or("None"));
        PropertyTag {
            name: names.intern_instanced(name),
            type_name: Name::new(type_name),
            property_type,
            struct_name: None,
            enum_name: None,
            array_index: 0,
            size: 0,
            value,
        }
    }

    /// Struct tag with the given struct type
    pub fn new_struct(names: &mut NameTable, name: &str, struct_name: &str, value: StructValue) -> Self {
        let mut tag = PropertyTag::new(names, name, PropertyType::Struct, PropertyValue::Struct(value));
        tag.struct_name = Some(Name::new(names.intern(struct_name)));
        tag
    }
}

/// Find the first tag named `name` (case-insensitive)
pub fn find_tag<'a>(tags: &'a [PropertyTag], names: &NameTable, name: &str) -> Option<&'a PropertyTag> {
    tags.iter().find(|t| names.matches(t.name, name))
}

pub fn tags_to_json(tags: &[PropertyTag], names: &NameTable, object: &dyn Fn(PackageIndex) -> String) -> Value {
    let mut map = serde_json::Map::new();
    for tag in tags {
        let mut key = names.display(tag.name).unwrap_or_else(|_| "<invalid>".into());
        if tag.array_index != 0 {
            key = format!("{}[{}]", key, tag.array_index);
        }
        map.insert(key, tag.value.to_json(names, object));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names_round_trip() {
        for ty in [
            PropertyType::Int,
            PropertyType::Bool,
            PropertyType::Struct,
            PropertyType::Map,
            PropertyType::QWord,
        ] {
            let name = ty.type_name().unwrap();
            assert_eq!(PropertyType::from_type_name(name), ty);
        }
        assert_eq!(PropertyType::from_type_name("FixedArrayProperty"), PropertyType::Unknown);
    }

    #[test]
    fn test_native_sizes() {
        assert_eq!(NativeStruct::encoded_size("Vector"), Some(12));
        assert_eq!(NativeStruct::encoded_size("Box"), Some(25));
        assert_eq!(NativeStruct::encoded_size("LightingChannelContainer"), None);
    }

    #[test]
    fn test_object_refs_collects_nested() {
        let mut names = NameTable::new();
        let inner = PropertyTag::new(&mut names, "Mat", PropertyType::Object, PropertyValue::Object(PackageIndex(-3)));
        let value = PropertyValue::Array(vec![
            PropertyValue::Object(PackageIndex(2)),
            PropertyValue::Object(PackageIndex::NULL),
            PropertyValue::Struct(StructValue::Tagged(vec![inner])),
        ]);
        let mut refs = Vec::new();
        value.object_refs(&mut refs);
        assert_eq!(refs, vec![PackageIndex(2), PackageIndex(-3)]);
    }

    #[test]
    fn test_json_view() {
        let mut names = NameTable::new();
        let tags = vec![
            PropertyTag::new(&mut names, "LODBias", PropertyType::Int, PropertyValue::Int(2)),
            PropertyTag::new(&mut names, "Parent", PropertyType::Object, PropertyValue::Object(PackageIndex(1))),
        ];
        let json = tags_to_json(&tags, &names, &|i| format!("obj{}", i));
        assert_eq!(json["LODBias"], 2);
        assert_eq!(json["Parent"], "obj1");
    }
}

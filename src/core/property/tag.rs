//! Property tag stream codec

use super::hints::{ElementHint, ValueKind};
use super::{NativeStruct, PropertyTag, PropertyType, PropertyValue, StructValue};
use crate::error::{GpkError, Result};
use crate::name::{Name, NameTable, NONE};
use crate::stream::Stream;

/// Per-class extension point consulted while a tag list is parsed
pub trait TagVisitor {
    /// Element kinds of the array or map property named `property`
    fn element_hint(&self, property: &str) -> Option<ElementHint>;

    /// Called once for each top-level tag right after it is parsed
    fn visit(&mut self, _tag: &PropertyTag, _names: &NameTable) -> Result<()> {
        Ok(())
    }
}

/// Shared state for one tag list parse
pub struct TagReader<'a> {
    pub names: &'a NameTable,
    pub visitor: &'a mut dyn TagVisitor,
    pub max_depth: usize,
}

/// Parse a `None`-terminated tag list at the stream's position
pub fn read_tags(stream: &mut Stream, reader: &mut TagReader<'_>) -> Result<Vec<PropertyTag>> {
    reader.read_list(stream, 0)
}

impl<'a> TagReader<'a> {
    fn read_list(&mut self, stream: &mut Stream, depth: usize) -> Result<Vec<PropertyTag>> {
        if depth > self.max_depth {
            return Err(GpkError::PropertyDepthExceeded {
                limit: self.max_depth,
            });
        }
        let mut tags = Vec::new();
        while let Some(tag) = self.read_tag(stream, depth)? {
            if depth == 0 {
                self.visitor.visit(&tag, self.names)?;
            }
            tags.push(tag);
        }
        Ok(tags)
    }

    fn read_name(&self, stream: &mut Stream) -> Result<Name> {
        self.names.check(Name::read(stream)?)
    }

    fn read_tag(&mut self, stream: &mut Stream, depth: usize) -> Result<Option<PropertyTag>> {
        let offset = stream.position();
        let name = self.read_name(stream)?;
        if self.names.is_none(name) {
            return Ok(None);
        }
        let type_name = self.read_name(stream)?;
        let property_type = PropertyType::from_type_name(self.names.resolve(type_name.token)?);
        let size = stream.read_i32()?;
        let array_index = stream.read_i32()?;
        let display = self.names.display(name)?;
        if size < 0 {
            return Err(GpkError::corrupt(
                format!("property {} at {:#x}", display, offset),
                format!("negative size {}", size),
            ));
        }

        let mut struct_name = None;
        let mut enum_name = None;
        match property_type {
            PropertyType::Struct => struct_name = Some(self.read_name(stream)?),
            PropertyType::Byte if stream.version().has_byte_enum_name() => {
                enum_name = Some(self.read_name(stream)?)
            }
            _ => {}
        }

        let value = if property_type == PropertyType::Bool {
            if stream.version().bool_in_size_field() {
                if size > 1 {
                    return Err(GpkError::corrupt(
                        format!("bool property {} at {:#x}", display, offset),
                        format!("size field {} is not a single bit", size),
                    ));
                }
                PropertyValue::Bool(size == 1)
            } else {
                if size != 0 {
                    return Err(GpkError::SizeMismatch {
                        context: format!("bool property {}", display),
                        expected: 0,
                        actual: size as usize,
                    });
                }
                PropertyValue::Bool(stream.read_u8()? != 0)
            }
        } else {
            let start = stream.position();
            let value = self.read_value(
                stream,
                property_type,
                &display,
                struct_name,
                size as usize,
                depth,
            )?;
            stream.expect_consumed(start, size as usize, &format!("property {}", display))?;
            value
        };

        Ok(Some(PropertyTag {
            name,
            type_name,
            property_type,
            struct_name,
            enum_name,
            array_index,
            size,
            value,
        }))
    }

    fn read_value(
        &mut self,
        stream: &mut Stream,
        property_type: PropertyType,
        property: &str,
        struct_name: Option<Name>,
        size: usize,
        depth: usize,
    ) -> Result<PropertyValue> {
        Ok(match property_type {
            PropertyType::Int => PropertyValue::Int(stream.read_i32()?),
            PropertyType::Float => PropertyValue::Float(stream.read_f32()?),
            PropertyType::QWord => PropertyValue::QWord(stream.read_u64()?),
            PropertyType::Byte => match size {
                1 => PropertyValue::Byte(stream.read_u8()?),
                8 => PropertyValue::Enum(self.read_name(stream)?),
                _ => PropertyValue::Raw(stream.read_bytes(size)?.to_vec()),
            },
            PropertyType::Name => PropertyValue::Name(self.read_name(stream)?),
            PropertyType::Str => PropertyValue::Str(stream.read_fstring()?),
            PropertyType::Object
            | PropertyType::Component
            | PropertyType::Class
            | PropertyType::Interface => PropertyValue::Object(stream.read_object_ref()?),
            PropertyType::Delegate => PropertyValue::Delegate {
                object: stream.read_object_ref()?,
                function: self.read_name(stream)?,
            },
            PropertyType::Struct => {
                let struct_name = match struct_name {
                    Some(n) => self.names.resolve(n.token)?.to_string(),
                    None => NONE.to_string(),
                };
                PropertyValue::Struct(self.read_struct(stream, &struct_name, depth)?)
            }
            PropertyType::Array => {
                let count = stream.read_i32()?;
                match self.visitor.element_hint(property) {
                    Some(ElementHint::Array(kind)) => {
                        let count = checked_count(count, property)?;
                        let mut items = Vec::with_capacity(count.min(size));
                        for _ in 0..count {
                            items.push(self.read_element(stream, kind, depth)?);
                        }
                        PropertyValue::Array(items)
                    }
                    _ => PropertyValue::RawArray {
                        count,
                        data: stream.read_bytes(size.saturating_sub(4))?.to_vec(),
                    },
                }
            }
            PropertyType::Map => {
                let count = stream.read_i32()?;
                match self.visitor.element_hint(property) {
                    Some(ElementHint::Map(key, value)) => {
                        let count = checked_count(count, property)?;
                        let mut pairs = Vec::with_capacity(count.min(size));
                        for _ in 0..count {
                            let k = self.read_element(stream, key, depth)?;
                            let v = self.read_element(stream, value, depth)?;
                            pairs.push((k, v));
                        }
                        PropertyValue::Map(pairs)
                    }
                    _ => PropertyValue::RawMap {
                        count,
                        data: stream.read_bytes(size.saturating_sub(4))?.to_vec(),
                    },
                }
            }
            PropertyType::Bool | PropertyType::Unknown => {
                PropertyValue::Raw(stream.read_bytes(size)?.to_vec())
            }
        })
    }

    fn read_struct(&mut self, stream: &mut Stream, struct_name: &str, depth: usize) -> Result<StructValue> {
        if NativeStruct::encoded_size(struct_name).is_some() {
            return Ok(StructValue::Native(read_native(stream, struct_name)?));
        }
        Ok(StructValue::Tagged(self.read_list(stream, depth + 1)?))
    }

    fn read_element(&mut self, stream: &mut Stream, kind: ValueKind, depth: usize) -> Result<PropertyValue> {
        Ok(match kind {
            ValueKind::Int => PropertyValue::Int(stream.read_i32()?),
            ValueKind::Float => PropertyValue::Float(stream.read_f32()?),
            ValueKind::Bool => PropertyValue::Bool(stream.read_u8()? != 0),
            ValueKind::Byte => PropertyValue::Byte(stream.read_u8()?),
            ValueKind::Name => PropertyValue::Name(self.read_name(stream)?),
            ValueKind::Str => PropertyValue::Str(stream.read_fstring()?),
            ValueKind::Object => PropertyValue::Object(stream.read_object_ref()?),
            ValueKind::Delegate => PropertyValue::Delegate {
                object: stream.read_object_ref()?,
                function: self.read_name(stream)?,
            },
            ValueKind::QWord => PropertyValue::QWord(stream.read_u64()?),
            ValueKind::Struct(name) => PropertyValue::Struct(self.read_struct(stream, name, depth)?),
        })
    }
}

fn checked_count(count: i32, property: &str) -> Result<usize> {
    usize::try_from(count).map_err(|_| {
        GpkError::corrupt(
            format!("property {}", property),
            format!("negative element count {}", count),
        )
    })
}

fn read_f32s<const N: usize>(stream: &mut Stream) -> Result<[f32; N]> {
    let mut out = [0f32; N];
    for v in out.iter_mut() {
        *v = stream.read_f32()?;
    }
    Ok(out)
}

fn read_i32s<const N: usize>(stream: &mut Stream) -> Result<[i32; N]> {
    let mut out = [0i32; N];
    for v in out.iter_mut() {
        *v = stream.read_i32()?;
    }
    Ok(out)
}

fn read_native(stream: &mut Stream, struct_name: &str) -> Result<NativeStruct> {
    Ok(match struct_name {
        "Vector" => NativeStruct::Vector(read_f32s(stream)?),
        "Vector2D" => NativeStruct::Vector2D(read_f32s(stream)?),
        "Vector4" => NativeStruct::Vector4(read_f32s(stream)?),
        "Rotator" => NativeStruct::Rotator(read_i32s(stream)?),
        "Color" => {
            let mut c = [0u8; 4];
            c.copy_from_slice(stream.read_bytes(4)?);
            NativeStruct::Color(c)
        }
        "LinearColor" => NativeStruct::LinearColor(read_f32s(stream)?),
        "Guid" => NativeStruct::Guid(stream.read_guid()?),
        "Quat" => NativeStruct::Quat(read_f32s(stream)?),
        "Plane" => NativeStruct::Plane(read_f32s(stream)?),
        "Box" => NativeStruct::Box {
            min: read_f32s(stream)?,
            max: read_f32s(stream)?,
            is_valid: stream.read_u8()?,
        },
        "IntPoint" => NativeStruct::IntPoint(read_i32s(stream)?),
        other => {
            return Err(GpkError::corrupt(
                "native struct",
                format!("{} is not a native struct", other),
            ))
        }
    })
}

fn write_native(stream: &mut Stream, value: &NativeStruct) -> Result<()> {
    let floats = |stream: &mut Stream, v: &[f32]| v.iter().try_for_each(|f| stream.write_f32(*f));
    let ints = |stream: &mut Stream, v: &[i32]| v.iter().try_for_each(|i| stream.write_i32(*i));
    match value {
        NativeStruct::Vector(v) => floats(stream, &v[..]),
        NativeStruct::Vector2D(v) => floats(stream, &v[..]),
        NativeStruct::Vector4(v)
        | NativeStruct::LinearColor(v)
        | NativeStruct::Quat(v)
        | NativeStruct::Plane(v) => floats(stream, &v[..]),
        NativeStruct::Rotator(r) => ints(stream, &r[..]),
        NativeStruct::Color(c) => stream.write_bytes(c),
        NativeStruct::Guid(g) => stream.write_guid(g),
        NativeStruct::Box { min, max, is_valid } => {
            floats(stream, &min[..])?;
            floats(stream, &max[..])?;
            stream.write_u8(*is_valid)
        }
        NativeStruct::IntPoint(p) => ints(stream, &p[..]),
    }
}

/// Write a tag list followed by the `None` terminator
///
/// Sizes are recomputed from the encoded values. `names` must already contain
/// `None` and every name the tags reference.
pub fn write_tags(stream: &mut Stream, names: &NameTable, tags: &[PropertyTag]) -> Result<()> {
    let none = names
        .find(NONE)
        .map(Name::new)
        .ok_or_else(|| GpkError::corrupt("name table", "missing None entry"))?;
    for tag in tags {
        write_tag(stream, tag, none)?;
    }
    none.write(stream)
}

fn write_tag(stream: &mut Stream, tag: &PropertyTag, none: Name) -> Result<()> {
    tag.name.write(stream)?;
    tag.type_name.write(stream)?;
    let size_pos = stream.position();
    stream.write_i32(0)?;
    stream.write_i32(tag.array_index)?;
    match tag.property_type {
        PropertyType::Struct => tag.struct_name.unwrap_or(none).write(stream)?,
        PropertyType::Byte if stream.version().has_byte_enum_name() => {
            tag.enum_name.unwrap_or(none).write(stream)?
        }
        _ => {}
    }
    if let (PropertyType::Bool, PropertyValue::Bool(value)) = (tag.property_type, &tag.value) {
        return if stream.version().bool_in_size_field() {
            stream.patch_i32(size_pos, *value as i32)
        } else {
            stream.write_u8(*value as u8)
        };
    }
    let start = stream.position();
    write_value(stream, &tag.value, none)?;
    let size = stream.position() - start;
    stream.patch_i32(size_pos, size as i32)
}

fn write_value(stream: &mut Stream, value: &PropertyValue, none: Name) -> Result<()> {
    match value {
        PropertyValue::Int(v) => stream.write_i32(*v),
        PropertyValue::Float(v) => stream.write_f32(*v),
        PropertyValue::Bool(v) => stream.write_u8(*v as u8),
        PropertyValue::Byte(v) => stream.write_u8(*v),
        PropertyValue::Enum(n) | PropertyValue::Name(n) => n.write(stream),
        PropertyValue::Str(s) => stream.write_fstring(s),
        PropertyValue::Object(i) => stream.write_index(*i),
        PropertyValue::Delegate { object, function } => {
            stream.write_index(*object)?;
            function.write(stream)
        }
        PropertyValue::Struct(StructValue::Native(s)) => write_native(stream, s),
        PropertyValue::Struct(StructValue::Tagged(tags)) => {
            for tag in tags {
                write_tag(stream, tag, none)?;
            }
            none.write(stream)
        }
        PropertyValue::Array(items) => {
            stream.write_count(items.len())?;
            items.iter().try_for_each(|v| write_value(stream, v, none))
        }
        PropertyValue::Map(pairs) => {
            stream.write_count(pairs.len())?;
            pairs.iter().try_for_each(|(k, v)| {
                write_value(stream, k, none)?;
                write_value(stream, v, none)
            })
        }
        PropertyValue::RawArray { count, data } | PropertyValue::RawMap { count, data } => {
            stream.write_i32(*count)?;
            stream.write_bytes(data)
        }
        PropertyValue::QWord(v) => stream.write_u64(*v),
        PropertyValue::Raw(data) => stream.write_bytes(data),
    }
}

#[cfg(test)]
mod tests {
    use super::super::hints::OBJECT_HINTS;
    use super::super::lookup_hint;
    use super::*;
    use crate::directory::PackageIndex;
    use crate::version::FormatVersion;

    struct Hints(Vec<PropertyTag>);

    impl TagVisitor for Hints {
        fn element_hint(&self, property: &str) -> Option<ElementHint> {
            if property.eq_ignore_ascii_case("Weights") {
                return Some(ElementHint::Map(ValueKind::Name, ValueKind::Float));
            }
            lookup_hint(&[OBJECT_HINTS], property)
        }

        fn visit(&mut self, tag: &PropertyTag, _names: &NameTable) -> Result<()> {
            self.0.push(tag.clone());
            Ok(())
        }
    }

    fn names() -> NameTable {
        let mut names = NameTable::new();
        names.intern(NONE);
        names
    }

    fn parse(bytes: Vec<u8>, names: &NameTable, version: FormatVersion, max_depth: usize) -> Result<(Vec<PropertyTag>, usize)> {
        let mut visitor = Hints(Vec::new());
        let mut reader = TagReader {
            names,
            visitor: &mut visitor,
            max_depth,
        };
        let mut input = Stream::from_vec(bytes, version);
        let tags = read_tags(&mut input, &mut reader)?;
        assert_eq!(input.remaining(), 0);
        Ok((tags, visitor.0.len()))
    }

    fn encode(names: &NameTable, tags: &[PropertyTag], version: FormatVersion) -> Vec<u8> {
        let mut out = Stream::writer(version);
        write_tags(&mut out, names, tags).unwrap();
        out.into_bytes().unwrap()
    }

    fn sample(names: &mut NameTable) -> Vec<PropertyTag> {
        let lod = names.intern("LOD");
        let inner = vec![PropertyTag::new(names, "Scale", PropertyType::Float, PropertyValue::Float(0.5))];
        let mut byte = PropertyTag::new(names, "Filter", PropertyType::Byte, PropertyValue::Enum(Name::new(lod)));
        byte.enum_name = Some(Name::new(names.intern("TextureFilter")));
        let weights = names.intern("Bone");
        vec![
            PropertyTag::new(names, "SizeX", PropertyType::Int, PropertyValue::Int(256)),
            PropertyTag::new(names, "bNeverStream", PropertyType::Bool, PropertyValue::Bool(true)),
            byte,
            PropertyTag::new(names, "Label", PropertyType::Str, PropertyValue::Str("Grass".into())),
            PropertyTag::new(names, "Parent", PropertyType::Object, PropertyValue::Object(PackageIndex(-2))),
            PropertyTag::new_struct(
                names,
                "Location",
                "Vector",
                StructValue::Native(NativeStruct::Vector([1.0, 2.0, 3.0])),
            ),
            PropertyTag::new_struct(names, "Settings", "LightmassSettings", StructValue::Tagged(inner)),
            PropertyTag::new(
                names,
                "Components",
                PropertyType::Array,
                PropertyValue::Array(vec![
                    PropertyValue::Object(PackageIndex(3)),
                    PropertyValue::Object(PackageIndex(4)),
                ]),
            ),
            PropertyTag::new(
                names,
                "Unhinted",
                PropertyType::Array,
                PropertyValue::RawArray {
                    count: 2,
                    data: vec![1, 0, 0, 0, 2, 0, 0, 0],
                },
            ),
            PropertyTag::new(
                names,
                "Weights",
                PropertyType::Map,
                PropertyValue::Map(vec![(PropertyValue::Name(Name::new(weights)), PropertyValue::Float(1.0))]),
            ),
        ]
    }

    #[test]
    fn test_round_trip_both_versions() {
        for version in [FormatVersion::Legacy, FormatVersion::Modern] {
            let mut names = names();
            let tags = sample(&mut names);
            let bytes = encode(&names, &tags, version);
            let (parsed, visited) = parse(bytes.clone(), &names, version, 64).unwrap();
            assert_eq!(visited, tags.len());
            assert_eq!(parsed.len(), tags.len());
            for (a, b) in parsed.iter().zip(&tags) {
                assert_eq!(a.value, b.value);
                assert_eq!(a.name, b.name);
            }
            // Sizes recorded on read reproduce the same bytes
            assert_eq!(encode(&names, &parsed, version), bytes);
        }
    }

    #[test]
    fn test_bool_encoding_by_version() {
        let mut names = names();
        for value in [true, false] {
            let tags = vec![PropertyTag::new(&mut names, "bHidden", PropertyType::Bool, PropertyValue::Bool(value))];
            let legacy = encode(&names, &tags, FormatVersion::Legacy);
            let modern = encode(&names, &tags, FormatVersion::Modern);

            // name(8) + type(8) + size(4) + index(4), then None(8)
            assert_eq!(legacy.len(), 24 + 8);
            assert_eq!(&legacy[16..20], &(value as i32).to_le_bytes());
            assert_eq!(&legacy[20..24], &0i32.to_le_bytes());

            // Modern: size 0 and one value byte after the header
            assert_eq!(modern.len(), 24 + 1 + 8);
            assert_eq!(&modern[16..20], &0i32.to_le_bytes());
            assert_eq!(modern[24], value as u8);

            for (bytes, version) in [(legacy, FormatVersion::Legacy), (modern, FormatVersion::Modern)] {
                let (parsed, _) = parse(bytes, &names, version, 64).unwrap();
                assert_eq!(parsed[0].value, PropertyValue::Bool(value));
            }
        }
    }

    #[test]
    fn test_legacy_bool_size_field_must_be_a_bit() {
        let mut names = names();
        let tags = vec![PropertyTag::new(&mut names, "bHidden", PropertyType::Bool, PropertyValue::Bool(true))];
        let mut bytes = encode(&names, &tags, FormatVersion::Legacy);
        bytes[16..20].copy_from_slice(&2i32.to_le_bytes());
        let err = parse(bytes, &names, FormatVersion::Legacy, 64).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corruption);
    }

    #[test]
    fn test_size_mismatch_detected() {
        let mut names = names();
        let tags = vec![PropertyTag::new(&mut names, "Count", PropertyType::Int, PropertyValue::Int(9))];
        let mut bytes = encode(&names, &tags, FormatVersion::Legacy);
        bytes[16..20].copy_from_slice(&8i32.to_le_bytes());
        bytes.splice(28..28, [0u8; 4]);
        let err = parse(bytes, &names, FormatVersion::Legacy, 64).unwrap_err();
        assert!(matches!(err, GpkError::SizeMismatch { expected: 8, actual: 4, .. }));
    }

    #[test]
    fn test_depth_limit() {
        let mut names = names();
        let mut value = StructValue::Tagged(Vec::new());
        for _ in 0..10 {
            value = StructValue::Tagged(vec![PropertyTag::new_struct(&mut names, "Inner", "Nested", value)]);
        }
        let tags = vec![PropertyTag::new_struct(&mut names, "Root", "Nested", value)];
        let bytes = encode(&names, &tags, FormatVersion::Modern);
        assert!(parse(bytes.clone(), &names, FormatVersion::Modern, 64).is_ok());
        assert!(matches!(
            parse(bytes, &names, FormatVersion::Modern, 4),
            Err(GpkError::PropertyDepthExceeded { limit: 4 })
        ));
    }

    #[test]
    fn test_unknown_type_kept_raw() {
        let mut names = names();
        let mut tag = PropertyTag::new(&mut names, "Odd", PropertyType::Unknown, PropertyValue::Raw(vec![9, 9, 9]));
        tag.type_name = Name::new(names.intern("FancyProperty"));
        let bytes = encode(&names, &[tag], FormatVersion::Legacy);
        let (parsed, _) = parse(bytes, &names, FormatVersion::Legacy, 64).unwrap();
        assert_eq!(parsed[0].property_type, PropertyType::Unknown);
        assert_eq!(parsed[0].value, PropertyValue::Raw(vec![9, 9, 9]));
    }

    #[test]
    fn test_bad_name_index() {
        let names = names();
        let mut bytes = 40i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(
            parse(bytes, &names, FormatVersion::Legacy, 64),
            Err(GpkError::InvalidName(40))
        ));
    }
}

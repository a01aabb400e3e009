//! Object serial data: net index, tags, class payload

use super::kind::ClassKind;
use crate::bulk_data::BulkData;
use crate::directory::PackageIndex;
use crate::error::{GpkError, Result};
use crate::name::NameTable;
use crate::property::{read_tags, write_tags, ElementHint, PropertyTag, TagReader, TagVisitor};
use crate::stream::Stream;

/// One texture mip level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mip {
    pub data: BulkData,
    pub size_x: i32,
    pub size_y: i32,
}

/// Binary data a class stores after its tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPayload {
    None,
    Redirector { target: PackageIndex },
    References(Vec<PackageIndex>),
    Texture { source_art: BulkData, mips: Vec<Mip> },
    Sound { data: BulkData },
    Level { actors: Vec<PackageIndex> },
}

impl ObjectPayload {
    fn read(kind: ClassKind, stream: &mut Stream) -> Result<Self> {
        Ok(match kind {
            ClassKind::ObjectRedirector => ObjectPayload::Redirector {
                target: stream.read_object_ref()?,
            },
            ClassKind::ObjectReferencer => {
                ObjectPayload::References(stream.read_array(4, "referenced objects", |s| s.read_object_ref())?)
            }
            ClassKind::Texture2D => {
                let source_art = BulkData::read(stream)?;
                let mips = stream.read_array(24, "texture mips", |s| {
                    Ok(Mip {
                        data: BulkData::read(s)?,
                        size_x: s.read_i32()?,
                        size_y: s.read_i32()?,
                    })
                })?;
                ObjectPayload::Texture { source_art, mips }
            }
            ClassKind::SoundNodeWave => ObjectPayload::Sound {
                data: BulkData::read(stream)?,
            },
            ClassKind::Level => ObjectPayload::Level {
                actors: stream.read_array(4, "level actors", |s| s.read_object_ref())?,
            },
            _ => ObjectPayload::None,
        })
    }

    fn write(&self, stream: &mut Stream) -> Result<()> {
        match self {
            ObjectPayload::None => Ok(()),
            ObjectPayload::Redirector { target } => stream.write_index(*target),
            ObjectPayload::References(refs) | ObjectPayload::Level { actors: refs } => {
                stream.write_array(refs, |s, r| s.write_index(*r))
            }
            ObjectPayload::Texture { source_art, mips } => {
                source_art.write(stream)?;
                stream.write_array(mips, |s, mip| {
                    mip.data.write(s)?;
                    s.write_i32(mip.size_x)?;
                    s.write_i32(mip.size_y)
                })
            }
            ObjectPayload::Sound { data } => data.write(stream),
        }
    }

    /// Object references held by the payload
    pub fn object_refs(&self) -> Vec<PackageIndex> {
        match self {
            ObjectPayload::Redirector { target } if !target.is_null() => vec![*target],
            ObjectPayload::References(refs) | ObjectPayload::Level { actors: refs } => {
                refs.iter().copied().filter(|r| !r.is_null()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Deserialized state of a loaded object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBody {
    pub net_index: i32,
    pub tags: Vec<PropertyTag>,
    pub payload: ObjectPayload,
    /// Bytes after the payload the handler does not interpret
    pub trailing: Vec<u8>,
    /// Every object reference met while parsing, in stream order
    pub dependencies: Vec<PackageIndex>,
}

impl ObjectBody {
    pub fn new(tags: Vec<PropertyTag>, payload: ObjectPayload) -> Self {
        ObjectBody {
            net_index: -1,
            tags,
            payload,
            trailing: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Parse a full serial blob; the stream must cover exactly the export's data
    pub fn read(
        stream: &mut Stream,
        kind: ClassKind,
        is_class_default: bool,
        names: &NameTable,
        max_depth: usize,
    ) -> Result<Self> {
        let net_index = stream.read_i32()?;
        let mut visitor = KindVisitor { kind };
        let mut reader = TagReader {
            names,
            visitor: &mut visitor,
            max_depth,
        };
        let tags = read_tags(stream, &mut reader)?;
        let payload = if is_class_default {
            ObjectPayload::None
        } else {
            ObjectPayload::read(kind, stream)?
        };
        let trailing = stream.read_bytes(stream.remaining())?.to_vec();
        let dependencies = stream
            .take_pending_refs()
            .into_iter()
            .map(|p| p.index)
            .collect();
        Ok(ObjectBody {
            net_index,
            tags,
            payload,
            trailing,
            dependencies,
        })
    }

    pub fn write(&self, stream: &mut Stream, names: &NameTable) -> Result<()> {
        stream.write_i32(self.net_index)?;
        write_tags(stream, names, &self.tags)?;
        self.payload.write(stream)?;
        stream.write_bytes(&self.trailing)
    }

    /// Object references reachable from the tags and payload
    pub fn object_refs(&self) -> Vec<PackageIndex> {
        let mut refs = Vec::new();
        for tag in &self.tags {
            tag.value.object_refs(&mut refs);
        }
        refs.extend(self.payload.object_refs());
        refs
    }
}

/// Feeds class hints to the tag parser and checks declared types of known tags
struct KindVisitor {
    kind: ClassKind,
}

impl TagVisitor for KindVisitor {
    fn element_hint(&self, property: &str) -> Option<ElementHint> {
        self.kind.element_hint(property)
    }

    fn visit(&mut self, tag: &PropertyTag, names: &NameTable) -> Result<()> {
        let name = names.display(tag.name)?;
        match self.kind.expected_type(&name) {
            Some(expected) if expected != tag.property_type => Err(GpkError::corrupt(
                format!("{} property {}", self.kind, name),
                format!(
                    "declared {:?}, expected {:?}",
                    tag.property_type, expected
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::NONE;
    use crate::property::{PropertyType, PropertyValue};
    use crate::version::FormatVersion;

    fn round_trip(kind: ClassKind, body: &ObjectBody, names: &NameTable) -> ObjectBody {
        let mut out = Stream::writer(FormatVersion::Modern);
        body.write(&mut out, names).unwrap();
        let mut input = Stream::from_vec(out.into_bytes().unwrap(), FormatVersion::Modern);
        ObjectBody::read(&mut input, kind, false, names, 64).unwrap()
    }

    #[test]
    fn test_redirector_payload_and_dependencies() {
        let mut names = NameTable::new();
        names.intern(NONE);
        let body = ObjectBody::new(Vec::new(), ObjectPayload::Redirector { target: PackageIndex(-4) });
        let parsed = round_trip(ClassKind::ObjectRedirector, &body, &names);
        assert_eq!(parsed.payload, body.payload);
        assert_eq!(parsed.dependencies, vec![PackageIndex(-4)]);
        assert!(parsed.trailing.is_empty());
    }

    #[test]
    fn test_texture_payload() {
        let mut names = NameTable::new();
        names.intern(NONE);
        let tags = vec![PropertyTag::new(&mut names, "SizeX", PropertyType::Int, PropertyValue::Int(64))];
        let payload = ObjectPayload::Texture {
            source_art: BulkData::inline(Vec::new()),
            mips: vec![Mip {
                data: BulkData::compressed(&[3u8; 4096]).unwrap(),
                size_x: 64,
                size_y: 64,
            }],
        };
        let parsed = round_trip(ClassKind::Texture2D, &ObjectBody::new(tags, payload), &names);
        match parsed.payload {
            ObjectPayload::Texture { mips, .. } => {
                assert_eq!(mips.len(), 1);
                assert_eq!(mips[0].data.decode().unwrap(), vec![3u8; 4096]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unknown_class_keeps_trailing_bytes() {
        let mut names = NameTable::new();
        names.intern(NONE);
        let mut body = ObjectBody::new(Vec::new(), ObjectPayload::None);
        body.trailing = vec![1, 2, 3, 4, 5];
        let parsed = round_trip(ClassKind::Object, &body, &names);
        assert_eq!(parsed.trailing, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_declared_type_checked() {
        let mut names = NameTable::new();
        names.intern(NONE);
        let tags = vec![PropertyTag::new(&mut names, "SizeX", PropertyType::Float, PropertyValue::Float(1.0))];
        let body = ObjectBody::new(tags, ObjectPayload::None);
        let mut out = Stream::writer(FormatVersion::Modern);
        body.write(&mut out, &names).unwrap();
        let mut input = Stream::from_vec(out.into_bytes().unwrap(), FormatVersion::Modern);
        assert!(matches!(
            ObjectBody::read(&mut input, ClassKind::Texture2D, true, &names, 64),
            Err(GpkError::Corrupt { .. })
        ));
    }
}

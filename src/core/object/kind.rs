//! Class-name driven handler dispatch
//!
//! Every export gets a [`ClassKind`] from its class name when the package is
//! opened. The table is closed: names without an explicit arm fall back to
//! the component or actor family by suffix, and everything else is a plain
//! `Object`.

use crate::property::{
    lookup_hint, ElementHint, HintTable, PropertyType, ValueKind, OBJECT_HINTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    Package,
    ObjectRedirector,
    Class,
    Texture2D,
    StaticMesh,
    SkeletalMesh,
    Material,
    MaterialInstanceConstant,
    SoundNodeWave,
    ObjectReferencer,
    World,
    Level,
    Component,
    Actor,
    Object,
}

const DISPATCH: &[(&str, ClassKind)] = &[
    ("Package", ClassKind::Package),
    ("ObjectRedirector", ClassKind::ObjectRedirector),
    ("Class", ClassKind::Class),
    ("Texture2D", ClassKind::Texture2D),
    ("TextureFlipBook", ClassKind::Texture2D),
    ("LightMapTexture2D", ClassKind::Texture2D),
    ("ShadowMapTexture2D", ClassKind::Texture2D),
    ("StaticMesh", ClassKind::StaticMesh),
    ("SkeletalMesh", ClassKind::SkeletalMesh),
    ("Material", ClassKind::Material),
    ("MaterialInstanceConstant", ClassKind::MaterialInstanceConstant),
    ("SoundNodeWave", ClassKind::SoundNodeWave),
    ("ObjectReferencer", ClassKind::ObjectReferencer),
    ("World", ClassKind::World),
    ("Level", ClassKind::Level),
];

const TEXTURE_HINTS: HintTable = &[];

const STATIC_MESH_HINTS: HintTable = &[
    ("Materials", ElementHint::Array(ValueKind::Object)),
    ("LODInfo", ElementHint::Array(ValueKind::Struct("StaticMeshLODInfo"))),
];

const SKELETAL_MESH_HINTS: HintTable = &[
    ("Materials", ElementHint::Array(ValueKind::Object)),
    ("LODInfo", ElementHint::Array(ValueKind::Struct("SkeletalMeshLODInfo"))),
    ("ClothBones", ElementHint::Array(ValueKind::Name)),
    ("BoundsPreviewAsset", ElementHint::Array(ValueKind::Object)),
];

const MATERIAL_HINTS: HintTable = &[
    ("Expressions", ElementHint::Array(ValueKind::Object)),
    ("ReferencedTextures", ElementHint::Array(ValueKind::Object)),
    ("EditorComments", ElementHint::Array(ValueKind::Object)),
];

const MIC_HINTS: HintTable = &[
    (
        "ScalarParameterValues",
        ElementHint::Array(ValueKind::Struct("ScalarParameterValue")),
    ),
    (
        "TextureParameterValues",
        ElementHint::Array(ValueKind::Struct("TextureParameterValue")),
    ),
    (
        "VectorParameterValues",
        ElementHint::Array(ValueKind::Struct("VectorParameterValue")),
    ),
    ("ReferencedTextures", ElementHint::Array(ValueKind::Object)),
];

const SOUND_HINTS: HintTable = &[
    ("ChannelOffsets", ElementHint::Array(ValueKind::Int)),
    ("ChannelSizes", ElementHint::Array(ValueKind::Int)),
];

const REFERENCER_HINTS: HintTable = &[("ReferencedObjects", ElementHint::Array(ValueKind::Object))];

const WORLD_HINTS: HintTable = &[
    ("StreamingLevels", ElementHint::Array(ValueKind::Object)),
    ("ExtraReferencedObjects", ElementHint::Array(ValueKind::Object)),
];

const ACTOR_HINTS: HintTable = &[
    ("Attached", ElementHint::Array(ValueKind::Object)),
    ("Touching", ElementHint::Array(ValueKind::Object)),
];

const COMPONENT_HINTS: HintTable = &[
    ("Materials", ElementHint::Array(ValueKind::Object)),
    ("IrrelevantLights", ElementHint::Array(ValueKind::Struct("Guid"))),
];

const NO_HINTS: HintTable = &[];

/// Declared types of tags each kind interprets
const TEXTURE_TYPES: &[(&str, PropertyType)] = &[
    ("SizeX", PropertyType::Int),
    ("SizeY", PropertyType::Int),
    ("OriginalSizeX", PropertyType::Int),
    ("OriginalSizeY", PropertyType::Int),
    ("Format", PropertyType::Byte),
    ("LODGroup", PropertyType::Byte),
    ("TextureFileCacheName", PropertyType::Name),
];

const MIC_TYPES: &[(&str, PropertyType)] = &[("Parent", PropertyType::Object)];

const SOUND_TYPES: &[(&str, PropertyType)] = &[
    ("Duration", PropertyType::Float),
    ("NumChannels", PropertyType::Int),
    ("SampleRate", PropertyType::Int),
];

impl ClassKind {
    /// Select a handler from a class name
    pub fn from_class_name(class_name: &str) -> Self {
        if let Some((_, kind)) = DISPATCH
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(class_name))
        {
            return *kind;
        }
        let lower = class_name.to_ascii_lowercase();
        if lower.ends_with("component") {
            ClassKind::Component
        } else if lower.ends_with("actor") {
            ClassKind::Actor
        } else {
            ClassKind::Object
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ClassKind::Package => "Package",
            ClassKind::ObjectRedirector => "ObjectRedirector",
            ClassKind::Class => "Class",
            ClassKind::Texture2D => "Texture2D",
            ClassKind::StaticMesh => "StaticMesh",
            ClassKind::SkeletalMesh => "SkeletalMesh",
            ClassKind::Material => "Material",
            ClassKind::MaterialInstanceConstant => "MaterialInstanceConstant",
            ClassKind::SoundNodeWave => "SoundNodeWave",
            ClassKind::ObjectReferencer => "ObjectReferencer",
            ClassKind::World => "World",
            ClassKind::Level => "Level",
            ClassKind::Component => "Component",
            ClassKind::Actor => "Actor",
            ClassKind::Object => "Object",
        }
    }

    fn hint_table(self) -> HintTable {
        match self {
            ClassKind::Texture2D => TEXTURE_HINTS,
            ClassKind::StaticMesh => STATIC_MESH_HINTS,
            ClassKind::SkeletalMesh => SKELETAL_MESH_HINTS,
            ClassKind::Material => MATERIAL_HINTS,
            ClassKind::MaterialInstanceConstant => MIC_HINTS,
            ClassKind::SoundNodeWave => SOUND_HINTS,
            ClassKind::ObjectReferencer => REFERENCER_HINTS,
            ClassKind::World | ClassKind::Level => WORLD_HINTS,
            ClassKind::Actor => ACTOR_HINTS,
            ClassKind::Component => COMPONENT_HINTS,
            _ => NO_HINTS,
        }
    }

    /// Element kinds for array/map properties of this class
    pub fn element_hint(self, property: &str) -> Option<ElementHint> {
        lookup_hint(&[self.hint_table(), OBJECT_HINTS], property)
    }

    /// Declared type this kind expects for `property`, if it interprets it
    pub fn expected_type(self, property: &str) -> Option<PropertyType> {
        let table: &[(&str, PropertyType)] = match self {
            ClassKind::Texture2D => TEXTURE_TYPES,
            ClassKind::MaterialInstanceConstant => MIC_TYPES,
            ClassKind::SoundNodeWave => SOUND_TYPES,
            _ => &[],
        };
        table
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(property))
            .map(|(_, ty)| *ty)
    }

    /// Payload carries bulk data whose stored offsets depend on placement
    pub fn has_inline_bulk(self) -> bool {
        matches!(self, ClassKind::Texture2D | ClassKind::SoundNodeWave)
    }
}

impl std::fmt::Display for ClassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

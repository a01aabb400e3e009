//! Element kinds for array and map properties
//!
//! The wire format does not record what an array or map holds, so each
//! class supplies a table of known property names and their element kinds.

/// Encoded kind of one array/map element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Byte,
    Name,
    Str,
    Object,
    Delegate,
    QWord,
    /// Struct by name; native structs are fixed-size, others are tagged lists
    Struct(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementHint {
    Array(ValueKind),
    Map(ValueKind, ValueKind),
}

/// Static `(property name, hint)` table
pub type HintTable = &'static [(&'static str, ElementHint)];

/// Case-insensitive lookup over a chain of hint tables
pub fn lookup(tables: &[HintTable], property: &str) -> Option<ElementHint> {
    tables.iter().find_map(|table| {
        table
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(property))
            .map(|(_, hint)| *hint)
    })
}

/// Hints shared by every class (Object-level properties)
pub const OBJECT_HINTS: HintTable = &[
    ("Tags", ElementHint::Array(ValueKind::Name)),
    ("Components", ElementHint::Array(ValueKind::Object)),
    ("Children", ElementHint::Array(ValueKind::Object)),
];

//! Element kinds and per-node data stored in the tree arena.

use crate::array::ArrayState;
use crate::choice::ChoiceState;
use crate::fixup::FixupSpec;
use crate::mutability::Weight;
use crate::value::{Endian, LengthType, StringEncoding, Value, ValueType};
use std::collections::BTreeMap;
use std::fmt;

/// Stable index of a node in a [`DataTree`](crate::tree::DataTree) arena.
///
/// Slots are never reused, so a stale id can only ever point at a freed slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub(crate) usize);

impl ElementId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberSpec {
    pub size: u32,
    pub signed: bool,
    pub endian: Endian,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringSpec {
    pub encoding: StringEncoding,
    pub length: Option<u64>,
    pub length_type: LengthType,
    pub null_terminated: bool,
    pub pad_character: char,
}

impl Default for StringSpec {
    fn default() -> Self {
        Self {
            encoding: StringEncoding::Ascii,
            length: None,
            length_type: LengthType::Bytes,
            null_terminated: false,
            pad_character: '\0',
        }
    }
}

impl StringSpec {
    /// Declared length in bits when it does not depend on the content.
    pub fn fixed_bits(&self) -> Option<u64> {
        let length = self.length?;
        match self.length_type {
            LengthType::Bits => Some(length),
            LengthType::Bytes => length.checked_mul(8),
            LengthType::Chars => self.encoding.fixed_char_bits()?.checked_mul(length),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobSpec {
    /// Declared length in bits.
    pub length_bits: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleSpec {
    pub size: u32,
    pub endian: Endian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagsSpec {
    pub size: u32,
    pub endian: Endian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpec {
    pub position: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingSpec {
    /// Alignment modulus in bits.
    pub alignment: u64,
    /// Minimum number of bits between the measurement base and the end of the padding.
    pub min_size: u64,
    /// Name of the element the measurement starts from, instead of the enclosing container.
    pub aligned_to: Option<String>,
}

impl Default for PaddingSpec {
    fn default() -> Self {
        Self {
            alignment: 8,
            min_size: 0,
            aligned_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSpec {
    pub stream_name: String,
    pub attribute: u32,
    /// Fixed region length in bits.
    pub length_bits: Option<u64>,
    /// Distance in bits from the start of the enclosing container.
    pub offset_bits: Option<u64>,
}

/// The closed set of element kinds.
#[derive(Debug, Clone)]
pub enum ElementKind {
    Model,
    Block,
    Choice(ChoiceState),
    Array(ArrayState),
    Number(NumberSpec),
    String(StringSpec),
    Blob(BlobSpec),
    Double(DoubleSpec),
    Flags(FlagsSpec),
    Flag(FlagSpec),
    Padding(PaddingSpec),
    Stream(StreamSpec),
}

impl ElementKind {
    pub fn name(&self) -> &'static str {
        match self {
            ElementKind::Model => "DataModel",
            ElementKind::Block => "Block",
            ElementKind::Choice(_) => "Choice",
            ElementKind::Array(_) => "Array",
            ElementKind::Number(_) => "Number",
            ElementKind::String(_) => "String",
            ElementKind::Blob(_) => "Blob",
            ElementKind::Double(_) => "Double",
            ElementKind::Flags(_) => "Flags",
            ElementKind::Flag(_) => "Flag",
            ElementKind::Padding(_) => "Padding",
            ElementKind::Stream(_) => "Stream",
        }
    }

    /// Kinds whose rendered value comes from their children.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ElementKind::Model
                | ElementKind::Block
                | ElementKind::Choice(_)
                | ElementKind::Array(_)
                | ElementKind::Flags(_)
                | ElementKind::Stream(_)
        )
    }

    /// Leaves that take a value: the kinds a field override or relation can write.
    pub fn is_value_leaf(&self) -> bool {
        matches!(
            self,
            ElementKind::Number(_)
                | ElementKind::String(_)
                | ElementKind::Blob(_)
                | ElementKind::Double(_)
                | ElementKind::Flag(_)
        )
    }
}

/// One node of the element tree.
#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub kind: ElementKind,
    pub(crate) parent: Option<ElementId>,
    pub(crate) children: Vec<ElementId>,
    pub hints: BTreeMap<String, String>,
    pub mutable: bool,
    pub weight: Weight,
    pub field_id: Option<String>,
    /// The literal value from the document, replaced by cracked values.
    pub default_value: Option<Value>,
    /// Per-run value set through a field override.
    pub override_value: Option<Value>,
    /// Value cracked into a relation measurer; recomputed from the relation when rendering.
    pub(crate) cracked_value: Option<Value>,
    pub value_type: ValueType,
    pub token: bool,
    pub constraint: Option<String>,
    pub fixup: Option<FixupSpec>,
}

impl Element {
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            children: Vec::new(),
            hints: BTreeMap::new(),
            mutable: true,
            weight: Weight::Normal,
            field_id: None,
            default_value: None,
            override_value: None,
            cracked_value: None,
            value_type: ValueType::String,
            token: false,
            constraint: None,
            fixup: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    pub fn children(&self) -> &[ElementId] {
        &self.children
    }

    /// The value a render would use before relations: override, then literal.
    pub fn explicit_value(&self) -> Option<&Value> {
        self.override_value.as_ref().or(self.default_value.as_ref())
    }

    /// The most specific value known for this element, including cracked measurer values.
    pub fn current_value(&self) -> Option<&Value> {
        self.explicit_value().or(self.cracked_value.as_ref())
    }

    pub fn cracked_value(&self) -> Option<&Value> {
        self.cracked_value.as_ref()
    }
}

/// Convenience constructors used by tests and by the definition builder.
impl Element {
    pub fn block(name: impl Into<String>) -> Self {
        Self::new(name, ElementKind::Block)
    }

    pub fn number(name: impl Into<String>, size: u32, signed: bool, endian: Endian) -> Self {
        Self::new(
            name,
            ElementKind::Number(NumberSpec {
                size,
                signed,
                endian,
            }),
        )
    }

    pub fn string(name: impl Into<String>, spec: StringSpec) -> Self {
        Self::new(name, ElementKind::String(spec))
    }

    pub fn blob(name: impl Into<String>, length_bits: Option<u64>) -> Self {
        Self::new(name, ElementKind::Blob(BlobSpec { length_bits }))
    }

    pub fn flags(name: impl Into<String>, size: u32, endian: Endian) -> Self {
        Self::new(name, ElementKind::Flags(FlagsSpec { size, endian }))
    }

    pub fn flag(name: impl Into<String>, position: u32, size: u32) -> Self {
        Self::new(name, ElementKind::Flag(FlagSpec { position, size }))
    }

    pub fn padding(name: impl Into<String>, spec: PaddingSpec) -> Self {
        Self::new(name, ElementKind::Padding(spec))
    }
}

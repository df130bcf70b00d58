//! Element definitions: the parsed, not yet instantiated shape of a model.
//!
//! Definitions are plain owned trees. References and overrides are resolved
//! at this level as pure transformations before anything is built into a
//! [`DataTree`](crate::tree::DataTree).

use crate::element::{
    BlobSpec, DoubleSpec, FlagSpec, FlagsSpec, NumberSpec, PaddingSpec, StreamSpec, StringSpec,
};
use crate::fixup::FixupSpec;
use crate::relation::RelationKind;
use crate::value::{LengthType, ValueType};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum DefKind {
    Block,
    /// Children are the alternatives.
    Choice,
    Number(NumberSpec),
    String(StringSpec),
    Blob(BlobSpec),
    Double(DoubleSpec),
    Flags(FlagsSpec),
    Flag(FlagSpec),
    Padding(PaddingSpec),
    Stream(StreamSpec),
}

impl DefKind {
    pub fn tag(&self) -> &'static str {
        match self {
            DefKind::Block => "Block",
            DefKind::Choice => "Choice",
            DefKind::Number(_) => "Number",
            DefKind::String(_) => "String",
            DefKind::Blob(_) => "Blob",
            DefKind::Double(_) => "Double",
            DefKind::Flags(_) => "Flags",
            DefKind::Flag(_) => "Flag",
            DefKind::Padding(_) => "Padding",
            DefKind::Stream(_) => "Stream",
        }
    }

    /// Kinds that may hold child definitions.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            DefKind::Block | DefKind::Choice | DefKind::Flags(_) | DefKind::Stream(_)
        )
    }
}

/// Occurrence attributes that turn a definition into an array.
#[derive(Debug, Clone, PartialEq)]
pub struct OccursDef {
    pub min: u32,
    /// `None` means unbounded.
    pub max: Option<u32>,
    pub occurs: u32,
    /// Per-index replacements for the template, from indexed overrides.
    pub instances: BTreeMap<u32, ElementDef>,
}

impl OccursDef {
    /// `occurs="n"` alone: exactly `n`.
    pub fn exactly(n: u32) -> Self {
        Self {
            min: n,
            max: Some(n),
            occurs: n,
            instances: BTreeMap::new(),
        }
    }

    /// Grows the policy so that `index` is a valid instance.
    pub fn include_index(&mut self, index: u32) -> Result<(), String> {
        let needed = index.saturating_add(1);
        if let Some(max) = self.max {
            if needed > max {
                return Err(format!("index exceeds maxOccurs {max}"));
            }
        }
        self.min = self.min.max(needed);
        self.occurs = self.occurs.max(needed);
        Ok(())
    }
}

/// A `<Relation>` as declared on its measurer.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub kind: RelationKind,
    pub of: String,
    pub length_type: LengthType,
    pub expression_get: Option<String>,
    pub expression_set: Option<String>,
    pub relative: bool,
    pub relative_to: Option<String>,
}

impl RelationDef {
    pub fn new(kind: RelationKind, of: impl Into<String>) -> Self {
        Self {
            kind,
            of: of.into(),
            length_type: LengthType::Bytes,
            expression_get: None,
            expression_set: None,
            relative: false,
            relative_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementDef {
    /// May be a dotted path when the definition overrides part of a reference.
    pub name: String,
    pub kind: DefKind,
    pub children: Vec<ElementDef>,
    pub hints: BTreeMap<String, String>,
    pub mutable: bool,
    pub field_id: Option<String>,
    pub value: Option<String>,
    pub value_type: ValueType,
    pub token: bool,
    pub constraint: Option<String>,
    pub occurs: Option<OccursDef>,
    pub relations: Vec<RelationDef>,
    pub fixup: Option<FixupSpec>,
}

impl ElementDef {
    pub fn new(name: impl Into<String>, kind: DefKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
            hints: BTreeMap::new(),
            mutable: true,
            field_id: None,
            value: None,
            value_type: ValueType::String,
            token: false,
            constraint: None,
            occurs: None,
            relations: Vec::new(),
            fixup: None,
        }
    }

    pub fn block(name: impl Into<String>, children: Vec<ElementDef>) -> Self {
        Self {
            children,
            ..Self::new(name, DefKind::Block)
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_occurs(mut self, occurs: OccursDef) -> Self {
        self.occurs = Some(occurs);
        self
    }

    pub fn with_relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn child(&self, name: &str) -> Option<&ElementDef> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut ElementDef> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// The definition an array instance is cloned from: this one, minus its
    /// occurrence policy.
    pub fn template(&self) -> ElementDef {
        ElementDef {
            occurs: None,
            ..self.clone()
        }
    }
}

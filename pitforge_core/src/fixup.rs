//! Fixups: value hooks that rewrite an element's rendered bits after the
//! layout is final.

use crate::bits::BitBuffer;
use crate::element::ElementId;
use crate::error::FixupError;
use crate::render::Span;
use crate::tree::DataTree;
use std::collections::{BTreeMap, HashMap};

/// A fixup as declared on an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixupSpec {
    pub class: String,
    pub params: BTreeMap<String, String>,
}

impl FixupSpec {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// What a fixup can see: the finished layout and its own parameters.
pub struct FixupContext<'a> {
    pub tree: &'a DataTree,
    pub element: ElementId,
    pub params: &'a BTreeMap<String, String>,
    pub(crate) bits: &'a BitBuffer,
    pub(crate) spans: &'a HashMap<ElementId, Span>,
}

impl FixupContext<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&str, FixupError> {
        self.param(name)
            .ok_or_else(|| FixupError::MissingParam(name.to_string()))
    }

    pub fn int_param(&self, name: &str, default: i128) -> Result<i128, FixupError> {
        match self.param(name) {
            None => Ok(default),
            Some(text) => crate::value::parse_integer(text).map_err(|_| FixupError::InvalidParam {
                name: name.to_string(),
                value: text.to_string(),
            }),
        }
    }

    /// Length in bits of the element the fixup is attached to.
    pub fn element_len(&self) -> u64 {
        self.spans.get(&self.element).map(|s| s.len).unwrap_or(0)
    }

    /// Resolves an element name relative to the fixup's element.
    pub fn resolve(&self, name: &str) -> Result<ElementId, FixupError> {
        self.tree
            .resolve_in_scope(self.element, name)
            .filter(|id| self.spans.contains_key(id))
            .ok_or_else(|| FixupError::UnresolvedRef(name.to_string()))
    }

    /// Rendered bits of a laid-out element.
    pub fn bits_of(&self, id: ElementId) -> Option<BitBuffer> {
        self.spans
            .get(&id)
            .map(|span| self.bits.slice(span.start, span.len))
    }
}

pub trait Fixup {
    fn class(&self) -> &'static str;

    /// Parameters that name other elements and must resolve at load time.
    fn ref_params(&self) -> &'static [&'static str] {
        &["ref"]
    }

    /// Produces the element's new bits; the length must not change.
    fn compute(&self, ctx: &FixupContext<'_>) -> Result<BitBuffer, FixupError>;
}

/// Fills an element with the byte sequence `start, start+1, ..., stop`,
/// repeating as needed.
#[derive(Debug, Default)]
pub struct FillValue;

impl Fixup for FillValue {
    fn class(&self) -> &'static str {
        "FillValue"
    }

    fn compute(&self, ctx: &FixupContext<'_>) -> Result<BitBuffer, FixupError> {
        let byte_param = |name: &str, default: i128| -> Result<u8, FixupError> {
            let value = ctx.int_param(name, default)?;
            u8::try_from(value).map_err(|_| FixupError::InvalidParam {
                name: name.to_string(),
                value: value.to_string(),
            })
        };
        let start = byte_param("start", 0)?;
        let stop = byte_param("stop", 255)?;
        if stop < start {
            return Err(FixupError::InvalidParam {
                name: "stop".into(),
                value: stop.to_string(),
            });
        }
        let len = match ctx.param("ref") {
            Some(name) => {
                let target = ctx.resolve(name)?;
                ctx.spans.get(&target).map(|s| s.len).unwrap_or(0)
            }
            None => ctx.element_len(),
        };
        let bytes: Vec<u8> = (start..=stop).cycle().take(len.div_ceil(8) as usize).collect();
        let mut out = BitBuffer::from_bytes(&bytes);
        out.truncate(len);
        Ok(out)
    }
}

/// Writes the MD5 digest of the referenced element.
#[derive(Debug, Default)]
pub struct Md5Fixup;

impl Fixup for Md5Fixup {
    fn class(&self) -> &'static str {
        "Md5Fixup"
    }

    fn compute(&self, ctx: &FixupContext<'_>) -> Result<BitBuffer, FixupError> {
        let name = ctx.require("ref")?;
        let target = ctx.resolve(name)?;
        let data = ctx
            .bits_of(target)
            .ok_or_else(|| FixupError::UnresolvedRef(name.to_string()))?;
        let digest = md5::compute(data.as_bytes());
        Ok(BitBuffer::from_bytes(&digest.0))
    }
}

/// Fixups by class name.
pub struct FixupRegistry {
    fixups: HashMap<String, Box<dyn Fixup>>,
}

impl FixupRegistry {
    pub fn empty() -> Self {
        Self {
            fixups: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(FillValue));
        registry.register(Box::new(Md5Fixup));
        registry
    }

    pub fn register(&mut self, fixup: Box<dyn Fixup>) {
        self.fixups.insert(fixup.class().to_string(), fixup);
    }

    pub fn get(&self, class: &str) -> Option<&dyn Fixup> {
        self.fixups.get(class).map(Box::as_ref)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.fixups.contains_key(class)
    }
}

impl Default for FixupRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for FixupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classes: Vec<&str> = self.fixups.keys().map(String::as_str).collect();
        classes.sort();
        f.debug_struct("FixupRegistry")
            .field("classes", &classes)
            .finish()
    }
}

//! Tree to bytes.
//!
//! Rendering lays the tree out top-down into a single bit buffer and records
//! the span of every element. Relation measurers are written as placeholders,
//! then patched in place once every target's span is known. If a patched
//! value changes its measurer's width the tree is laid out once more with the
//! computed values pinned. Fixups run last, against the final layout.

use crate::bits::BitBuffer;
use crate::element::{ElementId, ElementKind, FlagsSpec, StringSpec};
use crate::error::{FixupError, RenderError, ValueError};
use crate::fixup::{FixupContext, FixupRegistry};
use crate::flags;
use crate::padding;
use crate::relation::RelationKind;
use crate::script::{Evaluator, ExprEvaluator, Scope};
use crate::tree::DataTree;
use crate::value::{LengthType, Value, check_range, encode_float, encode_integer};
use log::{debug, warn};
use std::collections::HashMap;

/// Where an element landed in a rendered buffer, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub len: u64,
}

impl Span {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// The output of a render: the bits plus the layout that produced them.
#[derive(Debug, Clone)]
pub struct Rendered {
    bits: BitBuffer,
    spans: HashMap<ElementId, Span>,
    root: ElementId,
}

/// A named sub-stream and the bytes rendered into it.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedStream {
    pub name: String,
    pub attribute: u32,
    pub element: ElementId,
    pub content: BitBuffer,
}

impl Rendered {
    pub fn bits(&self) -> &BitBuffer {
        &self.bits
    }

    pub fn bytes(&self) -> &[u8] {
        self.bits.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits.into_bytes()
    }

    pub fn len_bits(&self) -> u64 {
        self.bits.len_bits()
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn span(&self, id: ElementId) -> Option<Span> {
        self.spans.get(&id).copied()
    }

    pub fn element_bits(&self, id: ElementId) -> Option<BitBuffer> {
        self.span(id).map(|s| self.bits.slice(s.start, s.len))
    }

    /// Hex MD5 of the rendered bytes.
    pub fn digest(&self) -> String {
        format!("{:x}", md5::compute(self.bytes()))
    }

    /// Every in-scope named stream under the rendered root, in document order.
    pub fn streams(&self, tree: &DataTree) -> Vec<NamedStream> {
        tree.preorder(self.root)
            .into_iter()
            .filter_map(|id| match tree.kind(id) {
                ElementKind::Stream(spec) => Some(NamedStream {
                    name: spec.stream_name.clone(),
                    attribute: spec.attribute,
                    element: id,
                    content: self.element_bits(id)?,
                }),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
struct Layout {
    bits: BitBuffer,
    starts: HashMap<ElementId, u64>,
    spans: HashMap<ElementId, Span>,
    measurers: Vec<ElementId>,
    fixups: Vec<ElementId>,
}

pub struct Renderer<'a> {
    evaluator: &'a dyn Evaluator,
    fixups: &'a FixupRegistry,
}

/// Renders the whole model with the default evaluator and built-in fixups.
pub fn render(tree: &mut DataTree) -> Result<Rendered, RenderError> {
    let fixups = FixupRegistry::with_builtins();
    Renderer::new(&ExprEvaluator, &fixups).render(tree)
}

impl<'a> Renderer<'a> {
    pub fn new(evaluator: &'a dyn Evaluator, fixups: &'a FixupRegistry) -> Self {
        Self { evaluator, fixups }
    }

    pub fn render(&self, tree: &mut DataTree) -> Result<Rendered, RenderError> {
        let root = tree.root();
        self.render_element(tree, root)
    }

    /// Renders the subtree at `id`; offsets are measured from its start.
    pub fn render_element(
        &self,
        tree: &mut DataTree,
        id: ElementId,
    ) -> Result<Rendered, RenderError> {
        let mut pinned: HashMap<ElementId, Value> = HashMap::new();
        for pass in 0..2 {
            let mut layout = Layout::default();
            self.emit(tree, id, &mut layout, &pinned)?;
            let unstable = self.apply_relations(tree, id, &mut layout, &mut pinned)?;
            match unstable {
                None => {
                    self.apply_fixups(tree, &mut layout)?;
                    return Ok(Rendered {
                        bits: layout.bits,
                        spans: layout.spans,
                        root: id,
                    });
                }
                Some(measurer) if pass == 0 => {
                    warn!(
                        "relation value changed the width of {}, laying out again",
                        tree.full_name(measurer)
                    );
                }
                Some(measurer) => {
                    return Err(RenderError::UnstableLength {
                        path: tree.full_name(measurer),
                    });
                }
            }
        }
        unreachable!("the second pass always returns")
    }

    fn emit(
        &self,
        tree: &mut DataTree,
        id: ElementId,
        out: &mut Layout,
        pinned: &HashMap<ElementId, Value>,
    ) -> Result<(), RenderError> {
        let mut start = out.bits.len_bits();
        out.starts.insert(id, start);
        let kind = tree.kind(id).clone();
        match kind {
            ElementKind::Model | ElementKind::Block => self.emit_children(tree, id, out, pinned)?,
            ElementKind::Array(_) => {
                tree.expand(id);
                self.emit_children(tree, id, out, pinned)?;
            }
            ElementKind::Choice(_) => {
                if tree.selected(id).is_none() {
                    return Err(RenderError::NoSelection {
                        path: tree.full_name(id),
                    });
                }
                self.emit_children(tree, id, out, pinned)?;
            }
            ElementKind::Stream(spec) => {
                if let Some(offset) = spec.offset_bits {
                    let base = tree
                        .parent(id)
                        .and_then(|p| out.starts.get(&p).copied())
                        .unwrap_or(0);
                    let target = base + offset;
                    if target < start {
                        return Err(RenderError::Stream {
                            path: tree.full_name(id),
                            reason: format!("offset {offset} lies behind bit {}", start - base),
                        });
                    }
                    out.bits.push_zeros(target - start);
                    start = target;
                    out.starts.insert(id, start);
                }
                self.emit_children(tree, id, out, pinned)?;
                if let Some(length) = spec.length_bits {
                    let written = out.bits.len_bits() - start;
                    if written > length {
                        return Err(RenderError::Stream {
                            path: tree.full_name(id),
                            reason: format!("{written} bits exceed declared length {length}"),
                        });
                    }
                    out.bits.push_zeros(length - written);
                }
            }
            ElementKind::Flags(spec) => {
                let (bits, measurers) = self.pack_flags(tree, id, &spec, pinned)?;
                out.measurers.extend(measurers);
                for flag in tree.children(id) {
                    out.spans.insert(
                        *flag,
                        Span {
                            start,
                            len: spec.size as u64,
                        },
                    );
                }
                out.bits.append(&bits);
            }
            // A flag only renders through its Flags container.
            ElementKind::Flag(_) => {}
            ElementKind::Padding(spec) => {
                let base_start = self.padding_base(tree, id, out)?;
                let filler = padding::filler_bits(&spec, start - base_start);
                out.bits.push_zeros(filler);
            }
            ElementKind::Number(_)
            | ElementKind::String(_)
            | ElementKind::Blob(_)
            | ElementKind::Double(_) => {
                let (value, measurer) = self.leaf_value(tree, id, pinned);
                if measurer {
                    out.measurers.push(id);
                }
                let bits = encode_leaf(&kind, &value).map_err(|source| RenderError::Value {
                    path: tree.full_name(id),
                    source,
                })?;
                out.bits.append(&bits);
            }
        }
        out.spans.insert(
            id,
            Span {
                start,
                len: out.bits.len_bits() - start,
            },
        );
        if tree.get(id).fixup.is_some() {
            out.fixups.push(id);
        }
        Ok(())
    }

    fn emit_children(
        &self,
        tree: &mut DataTree,
        id: ElementId,
        out: &mut Layout,
        pinned: &HashMap<ElementId, Value>,
    ) -> Result<(), RenderError> {
        for child in tree.children(id).to_vec() {
            self.emit(tree, child, out, pinned)?;
        }
        Ok(())
    }

    fn padding_base(
        &self,
        tree: &DataTree,
        id: ElementId,
        out: &Layout,
    ) -> Result<u64, RenderError> {
        let anchor_error = || {
            let anchor = match tree.kind(id) {
                ElementKind::Padding(spec) => spec.aligned_to.clone().unwrap_or_default(),
                _ => String::new(),
            };
            RenderError::Anchor {
                path: tree.full_name(id),
                anchor,
            }
        };
        let base = padding::measurement_base(tree, id).ok_or_else(anchor_error)?;
        match out.starts.get(&base) {
            Some(start) => Ok(*start),
            // The enclosing container lies outside a partial render.
            None if tree.ancestors(id).any(|a| a == base) => Ok(0),
            None => Err(anchor_error()),
        }
    }

    /// Value source for a leaf: field override, then literal, then relation
    /// (placeholder or pinned value), then zero. The flag reports whether the
    /// relation was used.
    fn leaf_value(
        &self,
        tree: &DataTree,
        id: ElementId,
        pinned: &HashMap<ElementId, Value>,
    ) -> (Value, bool) {
        let element = tree.get(id);
        if let Some(value) = element.explicit_value() {
            return (value.clone(), false);
        }
        if tree.effective_relation(id).is_some() {
            let value = pinned.get(&id).cloned().unwrap_or(Value::Integer(0));
            return (value, true);
        }
        (zero_value(&element.kind), false)
    }

    fn pack_flags(
        &self,
        tree: &DataTree,
        id: ElementId,
        spec: &FlagsSpec,
        pinned: &HashMap<ElementId, Value>,
    ) -> Result<(BitBuffer, Vec<ElementId>), RenderError> {
        let mut values = Vec::new();
        let mut measurers = Vec::new();
        for child in tree.children(id) {
            let ElementKind::Flag(flag) = tree.kind(*child) else {
                continue;
            };
            let (value, measurer) = self.leaf_value(tree, *child, pinned);
            if measurer {
                measurers.push(*child);
            }
            let value_error = |source| RenderError::Value {
                path: tree.full_name(*child),
                source,
            };
            let raw = value.as_integer().map_err(value_error)?;
            check_range(raw, flag.size, false).map_err(value_error)?;
            values.push((*flag, raw as u64));
        }
        Ok((flags::pack(spec, &values), measurers))
    }

    /// Computes every measurer and patches it into the layout. Returns the
    /// first measurer whose computed value changed width, if any.
    fn apply_relations(
        &self,
        tree: &DataTree,
        render_root: ElementId,
        out: &mut Layout,
        pinned: &mut HashMap<ElementId, Value>,
    ) -> Result<Option<ElementId>, RenderError> {
        let mut unstable = None;
        for measurer in std::mem::take(&mut out.measurers) {
            let value = self.relation_value(tree, render_root, measurer, out)?;
            debug!("{} = {value} from relation", tree.full_name(measurer));
            pinned.insert(measurer, value.clone());

            let (patch_id, bits) = match tree.kind(measurer) {
                ElementKind::Flag(_) => {
                    let Some(parent) = tree.parent(measurer) else {
                        continue;
                    };
                    let ElementKind::Flags(spec) = tree.kind(parent) else {
                        continue;
                    };
                    (parent, self.pack_flags(tree, parent, spec, pinned)?.0)
                }
                kind => {
                    let bits = encode_leaf(kind, &value).map_err(|source| RenderError::Value {
                        path: tree.full_name(measurer),
                        source,
                    })?;
                    (measurer, bits)
                }
            };
            let span = out.spans[&patch_id];
            if bits.len_bits() != span.len {
                unstable.get_or_insert(measurer);
                continue;
            }
            out.bits.overwrite(span.start, &bits);
        }
        Ok(unstable)
    }

    fn relation_value(
        &self,
        tree: &DataTree,
        render_root: ElementId,
        measurer: ElementId,
        out: &Layout,
    ) -> Result<Value, RenderError> {
        let path = tree.full_name(measurer);
        let fail = |reason: String| RenderError::Relation {
            path: path.clone(),
            reason,
        };
        let relation = tree
            .effective_relation(measurer)
            .ok_or_else(|| fail("relation target is no longer in scope".into()))?;
        let span_of = |id: ElementId| {
            out.spans
                .get(&id)
                .copied()
                .ok_or_else(|| fail(format!("{} was not rendered", tree.full_name(id))))
        };
        let quantity: i128 = match relation.kind {
            RelationKind::Size => to_units(span_of(relation.target)?.len as i128, relation.length_type),
            RelationKind::Count => match tree.kind(relation.target) {
                ElementKind::Array(_) => tree.instance_count(relation.target) as i128,
                kind if kind.is_container() => tree.children(relation.target).len() as i128,
                kind => return Err(fail(format!("cannot count a {}", kind.name()))),
            },
            RelationKind::Offset => {
                let target = span_of(relation.target)?.start as i128;
                let base = match (relation.relative_to, relation.relative) {
                    (Some(anchor), _) => span_of(anchor)?.start,
                    (None, true) => span_of(measurer)?.start,
                    (None, false) => span_of(render_root)?.start,
                };
                to_units(target - base as i128, relation.length_type)
            }
        };
        match &relation.expression_set {
            None => Ok(Value::Integer(quantity)),
            Some(expression) => {
                let scope = Scope::new()
                    .with(relation.kind.variable(), Value::Integer(quantity))
                    .with("value", Value::Integer(quantity));
                self.evaluator
                    .evaluate(expression, &scope)
                    .map_err(|source| RenderError::Script { path, source })
            }
        }
    }

    fn apply_fixups(&self, tree: &DataTree, out: &mut Layout) -> Result<(), RenderError> {
        for id in std::mem::take(&mut out.fixups) {
            let Some(spec) = tree.get(id).fixup.as_ref() else {
                continue;
            };
            let fixup_error = |source| RenderError::Fixup {
                path: tree.full_name(id),
                source,
            };
            let fixup = self
                .fixups
                .get(&spec.class)
                .ok_or_else(|| fixup_error(FixupError::UnknownClass(spec.class.clone())))?;
            let span = out.spans[&id];
            let bits = {
                let ctx = FixupContext {
                    tree,
                    element: id,
                    params: &spec.params,
                    bits: &out.bits,
                    spans: &out.spans,
                };
                fixup.compute(&ctx).map_err(fixup_error)?
            };
            if bits.len_bits() != span.len {
                return Err(fixup_error(FixupError::LengthChanged {
                    before: span.len,
                    after: bits.len_bits(),
                }));
            }
            out.bits.overwrite(span.start, &bits);
        }
        Ok(())
    }
}

/// Rounds a bit quantity up to the relation's unit.
fn to_units(bits: i128, length_type: LengthType) -> i128 {
    match length_type {
        LengthType::Bits => bits,
        LengthType::Bytes | LengthType::Chars => (bits + 7).div_euclid(8),
    }
}

fn zero_value(kind: &ElementKind) -> Value {
    match kind {
        ElementKind::Number(_) | ElementKind::Flag(_) => Value::Integer(0),
        ElementKind::Double(_) => Value::Float(0.0),
        ElementKind::String(_) => Value::Text(String::new()),
        _ => Value::Bits(BitBuffer::new()),
    }
}

/// Encodes a leaf value for its element kind.
///
/// Shorter values are padded to a declared length; longer ones are kept.
pub(crate) fn encode_leaf(kind: &ElementKind, value: &Value) -> Result<BitBuffer, ValueError> {
    match kind {
        ElementKind::Number(spec) => {
            encode_integer(value.as_integer()?, spec.size, spec.signed, spec.endian)
        }
        ElementKind::Double(spec) => encode_float(value.as_float()?, spec.size, spec.endian),
        ElementKind::String(spec) => encode_string(spec, value),
        ElementKind::Blob(spec) => {
            let mut bits = match value {
                Value::Bits(bits) => bits.clone(),
                Value::Text(text) => BitBuffer::from_bytes(text.as_bytes()),
                other => {
                    return Err(ValueError::Mismatch {
                        expected: "bytes",
                        found: other.type_name(),
                    });
                }
            };
            if let Some(length) = spec.length_bits {
                if bits.len_bits() < length {
                    bits.push_zeros(length - bits.len_bits());
                }
            }
            Ok(bits)
        }
        other => Err(ValueError::Mismatch {
            expected: "a value element",
            found: other.name(),
        }),
    }
}

fn encode_string(spec: &StringSpec, value: &Value) -> Result<BitBuffer, ValueError> {
    let (mut bytes, chars) = match value {
        Value::Bits(bits) => (bits.as_bytes().to_vec(), None),
        Value::Text(text) => (spec.encoding.encode(text)?, Some(text.chars().count() as u64)),
        other => {
            let text = other.to_string();
            (spec.encoding.encode(&text)?, Some(text.chars().count() as u64))
        }
    };
    if spec.null_terminated {
        bytes.extend(std::iter::repeat_n(0, spec.encoding.unit_bytes()));
    }
    let mut bits = BitBuffer::from_bytes(&bytes);
    let pad = spec.encoding.encode(&spec.pad_character.to_string())?;
    let pad = if pad.is_empty() { vec![0] } else { pad };

    match (spec.fixed_bits(), spec.length, chars) {
        (Some(length), _, _) if bits.len_bits() < length => {
            while bits.len_bits() < length {
                bits.push_bytes(&pad);
            }
            bits.truncate(length);
        }
        // Variable-width encodings measured in characters pad by character count.
        (None, Some(length), Some(count)) if spec.length_type == LengthType::Chars => {
            let terminator = spec.null_terminated as u64;
            for _ in (count + terminator)..length {
                bits.push_bytes(&pad);
            }
        }
        _ => {}
    }
    Ok(bits)
}

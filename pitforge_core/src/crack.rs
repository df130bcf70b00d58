//! Bytes to tree.
//!
//! Cracking walks the tree in document order and consumes input bits into
//! it. Each element is first placed (offset relations), then sized: from a
//! size relation whose measurer is already cracked, from a static size, from
//! its own content (containers, terminated strings, padding) or, as a last
//! resort, by looking ahead at what follows it. A sized element is cracked
//! inside a region carved to exactly that size.
//!
//! Choices and arrays are resolved by trial: an attempt runs on a copy of the
//! cursor and only commits when it succeeds.

use crate::bits::{BitBuffer, BitReader};
use crate::element::{ElementId, ElementKind, StringSpec};
use crate::error::{CrackError, CrackFailure, ValueError};
use crate::flags;
use crate::padding;
use crate::relation::{Relation, RelationKind};
use crate::render::{Span, encode_leaf};
use crate::script::{Evaluator, ExprEvaluator, Scope};
use crate::tree::DataTree;
use crate::value::{
    Endian, LengthType, StringEncoding, Value, decode_raw, raw_to_float, raw_to_integer,
};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrackSettings {
    /// Upper bound on instances for arrays without a count or `maxOccurs`.
    pub max_array_occurs: u32,
    /// Treat input left over after the model as an error.
    pub strict_trailing: bool,
}

impl Default for CrackSettings {
    fn default() -> Self {
        Self {
            max_array_occurs: 65_536,
            strict_trailing: false,
        }
    }
}

/// How much of the input a successful crack consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrackOutcome {
    pub consumed_bits: u64,
    pub remaining_bits: u64,
}

#[derive(Default)]
struct CrackState {
    starts: HashMap<ElementId, u64>,
    spans: HashMap<ElementId, Span>,
    cracked: HashSet<ElementId>,
    bounded: HashSet<ElementId>,
}

/// Where lookahead found the end of an unsized element.
enum Boundary {
    /// Everything up to the end of the current region, less `reserved` bits.
    RegionEnd { reserved: u64 },
    /// A token that must start `after` bits past the element's end.
    Token { after: u64, needle: BitBuffer },
    /// An element placed at an absolute position, `after` bits past the end.
    Placed { at: u64, after: u64 },
}

pub struct Cracker<'a> {
    evaluator: &'a dyn Evaluator,
    settings: CrackSettings,
}

/// Cracks `data` into the whole model with default settings.
pub fn crack(tree: &mut DataTree, data: &[u8]) -> Result<CrackOutcome, CrackError> {
    Cracker::new(&ExprEvaluator, CrackSettings::default()).crack(tree, data)
}

impl<'a> Cracker<'a> {
    pub fn new(evaluator: &'a dyn Evaluator, settings: CrackSettings) -> Self {
        Self {
            evaluator,
            settings,
        }
    }

    pub fn crack(&self, tree: &mut DataTree, data: &[u8]) -> Result<CrackOutcome, CrackError> {
        let mut reader = BitReader::new(data);
        let mut state = CrackState::default();
        let root = tree.root();
        self.crack_element(tree, root, &mut reader, &mut state)?;

        let remaining = reader.remaining();
        if remaining > 0 {
            if self.settings.strict_trailing {
                return Err(CrackError::new(
                    tree.full_name(root),
                    reader.position(),
                    CrackFailure::TrailingData { remaining },
                ));
            }
            warn!("{remaining} bits left over after cracking {}", tree.full_name(root));
        }
        info!(
            "cracked {} bytes into {}",
            reader.position() / 8,
            tree.full_name(root)
        );
        Ok(CrackOutcome {
            consumed_bits: reader.position(),
            remaining_bits: remaining,
        })
    }

    fn crack_element(
        &self,
        tree: &mut DataTree,
        id: ElementId,
        reader: &mut BitReader<'_>,
        state: &mut CrackState,
    ) -> Result<(), CrackError> {
        let at = reader.position();
        let fail = |tree: &DataTree, position: u64, kind| CrackError::new(tree.full_name(id), position, kind);

        if let Some(target) = self.placement(tree, id, state).map_err(|k| fail(tree, at, k))? {
            if target < at {
                return Err(fail(tree, at, CrackFailure::OffsetBehind { target }));
            }
            if !reader.seek(target) {
                return Err(fail(
                    tree,
                    at,
                    CrackFailure::OutOfData {
                        needed: target - at,
                        available: reader.remaining(),
                    },
                ));
            }
        }

        let start = reader.position();
        state.starts.insert(id, start);
        let size = self
            .size_of(tree, id, reader, state)
            .map_err(|k| fail(tree, start, k))?;
        trace!("cracking {} at bit {start}, size {size:?}", tree.full_name(id));

        match size {
            Some(len) => {
                let mut region = reader.carve(len).ok_or_else(|| {
                    fail(
                        tree,
                        start,
                        CrackFailure::OutOfData {
                            needed: len,
                            available: reader.remaining(),
                        },
                    )
                })?;
                state.bounded.insert(id);
                self.crack_body(tree, id, &mut region, state)?;
                reader.seek(start + len);
            }
            None => self.crack_body(tree, id, reader, state)?,
        }

        state.spans.insert(
            id,
            Span {
                start,
                len: reader.position() - start,
            },
        );
        state.cracked.insert(id);
        Ok(())
    }

    fn crack_body(
        &self,
        tree: &mut DataTree,
        id: ElementId,
        reader: &mut BitReader<'_>,
        state: &mut CrackState,
    ) -> Result<(), CrackError> {
        let fail = |tree: &DataTree, position: u64, kind| CrackError::new(tree.full_name(id), position, kind);
        let kind = tree.kind(id).clone();
        match &kind {
            ElementKind::Model | ElementKind::Block | ElementKind::Stream(_) => {
                for child in tree.children(id).to_vec() {
                    self.crack_element(tree, child, reader, state)?;
                }
            }
            ElementKind::Choice(_) => self.crack_choice(tree, id, reader, state)?,
            ElementKind::Array(_) => self.crack_array(tree, id, reader, state)?,
            ElementKind::Flags(spec) => {
                let start = reader.position();
                let packed = flags::read_packed(spec, reader).ok_or_else(|| {
                    fail(
                        tree,
                        start,
                        CrackFailure::OutOfData {
                            needed: spec.size as u64,
                            available: reader.remaining(),
                        },
                    )
                })?;
                for child in tree.children(id).to_vec() {
                    let ElementKind::Flag(flag) = *tree.kind(child) else {
                        continue;
                    };
                    let value = Value::Integer(flags::unpack(spec, &flag, packed) as i128);
                    self.check_leaf(tree, child, &value, &BitBuffer::new())
                        .map_err(|k| CrackError::new(tree.full_name(child), start, k))?;
                    store(tree, child, value);
                    state.spans.insert(
                        child,
                        Span {
                            start,
                            len: spec.size as u64,
                        },
                    );
                    state.cracked.insert(child);
                }
            }
            ElementKind::Flag(_) => {}
            ElementKind::Padding(spec) => {
                let at = reader.position();
                let base = padding::measurement_base(tree, id)
                    .and_then(|base| state.starts.get(&base).copied())
                    .ok_or_else(|| {
                        let anchor = spec.aligned_to.clone().unwrap_or_default();
                        fail(tree, at, CrackFailure::Anchor(anchor))
                    })?;
                let filler = padding::filler_bits(spec, at - base);
                take(reader, filler).map_err(|k| fail(tree, at, k))?;
            }
            ElementKind::Number(_)
            | ElementKind::String(_)
            | ElementKind::Blob(_)
            | ElementKind::Double(_) => {
                let at = reader.position();
                let bounded = state.bounded.contains(&id);
                let (value, raw) = read_leaf(&kind, reader, bounded).map_err(|k| fail(tree, at, k))?;
                self.check_leaf(tree, id, &value, &raw)
                    .map_err(|k| fail(tree, at, k))?;
                trace!("{} = {value}", tree.full_name(id));
                store(tree, id, value);
            }
        }
        Ok(())
    }

    fn crack_choice(
        &self,
        tree: &mut DataTree,
        choice: ElementId,
        reader: &mut BitReader<'_>,
        state: &mut CrackState,
    ) -> Result<(), CrackError> {
        let tried = tree.alternatives(choice).len();
        tree.clear_selection(choice);
        let mut deepest: Option<CrackError> = None;
        for index in 0..tried {
            let selected = tree.select(choice, index);
            let mut trial = *reader;
            match self.crack_element(tree, selected, &mut trial, state) {
                Ok(()) => {
                    debug!(
                        "{} matched alternative {}",
                        tree.full_name(choice),
                        tree.name(selected)
                    );
                    *reader = trial;
                    return Ok(());
                }
                Err(err) => {
                    trace!("{}: alternative {index} failed: {err}", tree.full_name(choice));
                    if deepest.as_ref().is_none_or(|d| err.bit_offset > d.bit_offset) {
                        deepest = Some(err);
                    }
                    tree.clear_selection(choice);
                }
            }
        }
        Err(CrackError::new(
            tree.full_name(choice),
            reader.position(),
            CrackFailure::NoMatchingAlternative {
                tried,
                deepest: deepest.map(Box::new),
            },
        ))
    }

    fn crack_array(
        &self,
        tree: &mut DataTree,
        array: ElementId,
        reader: &mut BitReader<'_>,
        state: &mut CrackState,
    ) -> Result<(), CrackError> {
        let at = reader.position();
        let fail = |tree: &DataTree, kind| CrackError::new(tree.full_name(array), at, kind);
        tree.clear_instances(array);
        tree.expand_to(array, 0);
        let policy = tree.array_state(array).clone();

        let counted = self
            .related_quantity(tree, array, RelationKind::Count, state)
            .map_err(|k| fail(tree, k))?
            .map(|(count, _)| count);
        if let Some(count) = counted {
            // An unbounded array still stops at the configured cap.
            let max = policy
                .max_occurs
                .unwrap_or_else(|| self.settings.max_array_occurs.max(policy.min_occurs));
            let in_range = count >= policy.min_occurs as u64 && count <= max as u64;
            let count = usize::try_from(count).ok().filter(|_| in_range).ok_or_else(|| {
                fail(
                    tree,
                    CrackFailure::CountOutOfRange {
                        count,
                        min: policy.min_occurs,
                        max,
                    },
                )
            })?;
            for index in 0..count {
                let instance = tree.make_instance(array, index);
                tree.attach(array, instance, None);
                self.crack_element(tree, instance, reader, state)?;
            }
            return Ok(());
        }

        let min = policy.min_occurs;
        let max = if policy.is_fixed() {
            min
        } else {
            policy
                .max_occurs
                .unwrap_or(u32::MAX)
                .min(self.settings.max_array_occurs.max(min))
        };
        let mut found = 0u32;
        while found < max {
            if found >= min && reader.is_exhausted() {
                break;
            }
            let instance = tree.make_instance(array, found as usize);
            tree.attach(array, instance, None);
            let mut trial = *reader;
            match self.crack_element(tree, instance, &mut trial, state) {
                Ok(()) if found >= min && trial.position() == reader.position() => {
                    tree.remove(instance);
                    break;
                }
                Ok(()) => {
                    *reader = trial;
                    found += 1;
                }
                Err(err) if found >= min => {
                    trace!("{} stops after {found}: {err}", tree.full_name(array));
                    tree.remove(instance);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if found < min {
            return Err(fail(tree, CrackFailure::ArrayTooShort { min, found }));
        }
        debug!("{} cracked {found} instance(s)", tree.full_name(array));
        Ok(())
    }

    /// Absolute position an element must start at, if anything places it.
    fn placement(
        &self,
        tree: &DataTree,
        id: ElementId,
        state: &CrackState,
    ) -> Result<Option<u64>, CrackFailure> {
        if let ElementKind::Stream(spec) = tree.kind(id) {
            if let Some(offset) = spec.offset_bits {
                let base = tree
                    .parent(id)
                    .and_then(|p| state.starts.get(&p).copied())
                    .unwrap_or(0);
                return base.checked_add(offset).map(Some).ok_or_else(|| overflow(offset));
            }
        }
        let Some((offset, relation)) = self.related_quantity(tree, id, RelationKind::Offset, state)?
        else {
            return Ok(None);
        };
        let base = match (relation.relative_to, relation.relative) {
            (Some(anchor), _) => *state.starts.get(&anchor).ok_or_else(|| {
                CrackFailure::InvalidRelationValue(format!(
                    "offset anchor {} has not been cracked",
                    tree.full_name(anchor)
                ))
            })?,
            (None, true) => state.starts.get(&relation.measurer).copied().unwrap_or(0),
            (None, false) => 0,
        };
        to_bits(offset, relation.length_type, None)
            .and_then(|bits| base.checked_add(bits))
            .map(Some)
            .ok_or_else(|| overflow(offset))
    }

    /// Size in bits when it is known before reading the element's content.
    fn size_of(
        &self,
        tree: &DataTree,
        id: ElementId,
        reader: &BitReader<'_>,
        state: &CrackState,
    ) -> Result<Option<u64>, CrackFailure> {
        if let Some(bits) = self.known_size(tree, id, state)? {
            return Ok(Some(bits));
        }
        match tree.kind(id) {
            ElementKind::Blob(_) => self.lookahead(tree, id, reader, state).map(Some),
            ElementKind::String(spec) if !self_sizing(spec) => {
                self.lookahead(tree, id, reader, state).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Size from a cracked size relation, a token literal or the static layout.
    fn known_size(
        &self,
        tree: &DataTree,
        id: ElementId,
        state: &CrackState,
    ) -> Result<Option<u64>, CrackFailure> {
        if let Some((size, relation)) = self.related_quantity(tree, id, RelationKind::Size, state)? {
            let char_bits = match tree.kind(id) {
                ElementKind::String(spec) => Some(spec.encoding.unit_bytes() as u64 * 8),
                _ => None,
            };
            return to_bits(size, relation.length_type, char_bits)
                .map(Some)
                .ok_or_else(|| overflow(size));
        }
        if let Some(needle) = token_bits(tree, id) {
            if static_bits(tree, id).is_none() {
                return Ok(Some(needle.len_bits()));
            }
        }
        Ok(static_bits(tree, id))
    }

    /// Infers an unsized element's length from the elements that follow it.
    fn lookahead(
        &self,
        tree: &DataTree,
        id: ElementId,
        reader: &BitReader<'_>,
        state: &CrackState,
    ) -> Result<u64, CrackFailure> {
        let position = reader.position();
        let boundary = self.find_boundary(tree, id, state)?;
        let end = match boundary {
            Boundary::RegionEnd { reserved } => {
                reader.region_end().checked_sub(reserved).ok_or(CrackFailure::OutOfData {
                    needed: reserved,
                    available: reader.remaining(),
                })?
            }
            Boundary::Token { after, needle } => {
                if after > reader.remaining() {
                    return Err(CrackFailure::OutOfData {
                        needed: after,
                        available: reader.remaining(),
                    });
                }
                let found = reader
                    .find(&needle, position + after)
                    .ok_or(CrackFailure::Unsized)?;
                found - after
            }
            Boundary::Placed { at, after } => at.checked_sub(after).ok_or(CrackFailure::Unsized)?,
        };
        end.checked_sub(position).ok_or(CrackFailure::OutOfData {
            needed: position - end,
            available: reader.remaining(),
        })
    }

    fn find_boundary(
        &self,
        tree: &DataTree,
        id: ElementId,
        state: &CrackState,
    ) -> Result<Boundary, CrackFailure> {
        let mut after = 0u64;
        let mut at = id;
        while let Some(parent) = tree.parent(at) {
            let siblings = tree.children(parent);
            let index = siblings.iter().position(|s| *s == at).unwrap_or(siblings.len());
            for next in siblings.iter().skip(index + 1).copied() {
                if let Some(placed) = self.placement(tree, next, state)? {
                    return Ok(Boundary::Placed { at: placed, after });
                }
                if let Some(needle) = token_bits(tree, next) {
                    return Ok(Boundary::Token { after, needle });
                }
                let size = self
                    .known_size(tree, next, state)?
                    .ok_or(CrackFailure::Unsized)?;
                after = after.checked_add(size).ok_or_else(|| overflow(size))?;
            }
            if matches!(tree.kind(parent), ElementKind::Array(_)) {
                return Err(CrackFailure::Unsized);
            }
            if state.bounded.contains(&parent) {
                return Ok(Boundary::RegionEnd { reserved: after });
            }
            at = parent;
        }
        Ok(Boundary::RegionEnd { reserved: after })
    }

    /// The first relation of `kind` targeting `id` whose measurer has been
    /// cracked, with its value in the relation's own units.
    fn related_quantity<'t>(
        &self,
        tree: &'t DataTree,
        id: ElementId,
        kind: RelationKind,
        state: &CrackState,
    ) -> Result<Option<(u64, &'t Relation)>, CrackFailure> {
        let Some(relation) = tree
            .relations_targeting(id, kind)
            .find(|r| state.cracked.contains(&r.measurer))
        else {
            return Ok(None);
        };
        let measured = tree
            .get(relation.measurer)
            .cracked_value()
            .cloned()
            .ok_or_else(|| {
                CrackFailure::InvalidRelationValue(format!(
                    "{} holds no value",
                    tree.full_name(relation.measurer)
                ))
            })?;
        let value = match &relation.expression_get {
            None => measured,
            Some(expression) => {
                let scope = Scope::new()
                    .with(kind.variable(), measured.clone())
                    .with("value", measured);
                self.evaluator.evaluate(expression, &scope)?
            }
        };
        let number = value.as_integer()?;
        let quantity = u64::try_from(number)
            .map_err(|_| CrackFailure::InvalidRelationValue(format!("{number} is negative or too large")))?;
        Ok(Some((quantity, relation)))
    }

    fn check_leaf(
        &self,
        tree: &DataTree,
        id: ElementId,
        value: &Value,
        raw: &BitBuffer,
    ) -> Result<(), CrackFailure> {
        let element = tree.get(id);
        if element.token {
            if let Some(expected) = element.explicit_value() {
                let matches = match &element.kind {
                    ElementKind::Flag(_) => expected.as_integer().ok() == value.as_integer().ok(),
                    kind => encode_leaf(kind, expected)? == *raw,
                };
                if !matches {
                    return Err(CrackFailure::TokenMismatch {
                        expected: expected.to_string(),
                        found: value.to_string(),
                    });
                }
            }
        }
        if let Some(expression) = &element.constraint {
            let scope = Scope::new().with("value", value.clone());
            if !self.evaluator.evaluate(expression, &scope)?.truthy() {
                return Err(CrackFailure::ConstraintFailed {
                    expression: expression.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Strings that know where they end without an external size.
fn self_sizing(spec: &StringSpec) -> bool {
    spec.null_terminated || (spec.length.is_some() && spec.length_type == LengthType::Chars)
}

/// Encoded literal of a token element.
fn token_bits(tree: &DataTree, id: ElementId) -> Option<BitBuffer> {
    let element = tree.get(id);
    if !element.token || !element.kind.is_value_leaf() {
        return None;
    }
    let value = element.explicit_value()?;
    encode_leaf(&element.kind, value).ok().filter(|b| !b.is_empty())
}

/// Size in bits fixed by the element's declaration alone.
fn static_bits(tree: &DataTree, id: ElementId) -> Option<u64> {
    match tree.kind(id) {
        ElementKind::Number(spec) => Some(spec.size as u64),
        ElementKind::Double(spec) => Some(spec.size as u64),
        ElementKind::Flags(spec) => Some(spec.size as u64),
        ElementKind::String(spec) => spec.fixed_bits(),
        ElementKind::Blob(spec) => spec.length_bits,
        ElementKind::Stream(spec) => spec.length_bits,
        ElementKind::Model | ElementKind::Block => tree
            .children(id)
            .iter()
            .map(|child| (!is_placed(tree, *child)).then(|| static_bits(tree, *child))?)
            .sum(),
        ElementKind::Choice(state) => {
            let mut sizes = state.alternatives.iter().map(|a| static_bits(tree, *a));
            let first = sizes.next()??;
            sizes.all(|s| s == Some(first)).then_some(first)
        }
        ElementKind::Array(state) if state.is_fixed() => {
            static_bits(tree, state.original)?.checked_mul(state.min_occurs as u64)
        }
        ElementKind::Array(_) | ElementKind::Flag(_) | ElementKind::Padding(_) => None,
    }
}

/// Elements whose start is set by an offset rather than by what precedes them.
fn is_placed(tree: &DataTree, id: ElementId) -> bool {
    let stream_offset = matches!(tree.kind(id), ElementKind::Stream(spec) if spec.offset_bits.is_some());
    stream_offset
        || tree
            .relations_targeting(id, RelationKind::Offset)
            .next()
            .is_some()
}

/// Converts a relation quantity to bits; `None` when it does not fit in 64 bits.
fn to_bits(quantity: u64, length_type: LengthType, char_bits: Option<u64>) -> Option<u64> {
    match length_type {
        LengthType::Bits => Some(quantity),
        LengthType::Bytes => quantity.checked_mul(8),
        LengthType::Chars => quantity.checked_mul(char_bits.unwrap_or(8)),
    }
}

fn overflow(quantity: u64) -> CrackFailure {
    CrackFailure::InvalidRelationValue(format!("{quantity} is too large to address in bits"))
}

/// Records a cracked value. Measurers keep it aside so rendering recomputes
/// them; everything else takes it as its new literal.
fn store(tree: &mut DataTree, id: ElementId, value: Value) {
    let measurer = tree.relations().is_measurer(id);
    let element = tree.get_mut(id);
    element.override_value = None;
    if measurer {
        element.cracked_value = Some(value);
    } else {
        element.default_value = Some(value);
    }
}

fn take(reader: &mut BitReader<'_>, bits: u64) -> Result<BitBuffer, CrackFailure> {
    reader.read_buffer(bits).ok_or(CrackFailure::OutOfData {
        needed: bits,
        available: reader.remaining(),
    })
}

fn read_leaf(
    kind: &ElementKind,
    reader: &mut BitReader<'_>,
    bounded: bool,
) -> Result<(Value, BitBuffer), CrackFailure> {
    match kind {
        ElementKind::Number(spec) => {
            let raw = take(reader, spec.size as u64)?;
            let bits = decode_bits(&raw, spec.size, spec.endian);
            Ok((Value::Integer(raw_to_integer(bits, spec.size, spec.signed)), raw))
        }
        ElementKind::Double(spec) => {
            let raw = take(reader, spec.size as u64)?;
            let bits = decode_bits(&raw, spec.size, spec.endian);
            Ok((Value::Float(raw_to_float(bits, spec.size)), raw))
        }
        ElementKind::Blob(_) => {
            let raw = take(reader, reader.remaining())?;
            Ok((Value::Bits(raw.clone()), raw))
        }
        ElementKind::String(spec) => read_string(spec, reader, bounded),
        other => Err(CrackFailure::Value(ValueError::Mismatch {
            expected: "a value element",
            found: other.name(),
        })),
    }
}

fn decode_bits(raw: &BitBuffer, size: u32, endian: Endian) -> u64 {
    decode_raw(&mut BitReader::new(raw.as_bytes()), size, endian).unwrap_or(0)
}

fn read_string(
    spec: &StringSpec,
    reader: &mut BitReader<'_>,
    bounded: bool,
) -> Result<(Value, BitBuffer), CrackFailure> {
    let unit = spec.encoding.unit_bytes();
    let (raw, mut content) = if bounded {
        let raw = take(reader, reader.remaining())?;
        let mut bytes = raw.as_bytes().to_vec();
        if spec.null_terminated {
            if let Some(end) = bytes.chunks(unit).position(|c| c.iter().all(|b| *b == 0)) {
                bytes.truncate(end * unit);
            }
        }
        (raw, bytes)
    } else if spec.null_terminated {
        let mut raw = BitBuffer::new();
        let mut bytes = Vec::new();
        loop {
            let chunk = take(reader, unit as u64 * 8)?;
            raw.append(&chunk);
            if chunk.as_bytes().iter().all(|b| *b == 0) {
                break;
            }
            bytes.extend_from_slice(chunk.as_bytes());
        }
        (raw, bytes)
    } else if let Some(count) = spec.length {
        let raw = read_chars(reader, spec.encoding, count)?;
        let bytes = raw.as_bytes().to_vec();
        (raw, bytes)
    } else {
        return Err(CrackFailure::Unsized);
    };
    if !spec.null_terminated && bounded && spec.pad_character == '\0' {
        // Fixed-length fields are padded with NUL by default.
        let keep = content
            .chunks(unit)
            .rposition(|c| c.iter().any(|b| *b != 0))
            .map_or(0, |last| (last + 1) * unit);
        content.truncate(keep);
    }
    let text = spec.encoding.decode(&content)?;
    Ok((Value::Text(text), raw))
}

/// Reads exactly `count` characters of a variable-width encoding.
fn read_chars(
    reader: &mut BitReader<'_>,
    encoding: StringEncoding,
    count: u64,
) -> Result<BitBuffer, CrackFailure> {
    let invalid = || CrackFailure::Value(ValueError::Encoding {
        encoding: encoding.name(),
    });
    let mut raw = BitBuffer::new();
    for _ in 0..count {
        match encoding {
            StringEncoding::Utf8 => {
                let lead = take(reader, 8)?;
                let first = lead.as_bytes()[0];
                let continuation = match first {
                    0x00..=0x7f => 0,
                    0xc0..=0xdf => 1,
                    0xe0..=0xef => 2,
                    0xf0..=0xf7 => 3,
                    _ => return Err(invalid()),
                };
                raw.append(&lead);
                raw.append(&take(reader, continuation * 8)?);
            }
            StringEncoding::Utf16 | StringEncoding::Utf16Be => {
                let unit = take(reader, 16)?;
                let bytes = [unit.as_bytes()[0], unit.as_bytes()[1]];
                let code = if encoding == StringEncoding::Utf16 {
                    u16::from_le_bytes(bytes)
                } else {
                    u16::from_be_bytes(bytes)
                };
                raw.append(&unit);
                if (0xd800..=0xdbff).contains(&code) {
                    raw.append(&take(reader, 16)?);
                }
            }
            fixed => {
                let bits = fixed.fixed_char_bits().ok_or_else(invalid)?;
                raw.append(&take(reader, bits)?);
            }
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayState;
    use crate::element::{Element, PaddingSpec};
    use crate::render::render;

    fn cracked_text(tree: &DataTree, id: ElementId) -> String {
        tree.get(id).current_value().map(|v| v.to_string()).unwrap_or_default()
    }

    fn array_of(tree: &mut DataTree, parent: ElementId, template: Element, min: u32, max: Option<u32>) -> ElementId {
        let name = template.name.clone();
        let array = tree.add_detached(parent, Element::block(name));
        let original = tree.add_detached(array, template);
        tree.get_mut(array).kind = ElementKind::Array(ArrayState::new(original, min, max, min));
        tree.attach(parent, array, None);
        array
    }

    #[test]
    fn size_relation_sizes_the_target() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let len = tree.append_child(root, Element::number("len", 8, false, Endian::Big));
        let data = tree.append_child(root, Element::blob("data", None));
        let tail = tree.append_child(root, Element::number("tail", 8, false, Endian::Big));
        tree.add_relation(Relation::new(RelationKind::Size, len, data));

        let outcome = crack(&mut tree, &[3, 1, 2, 3, 0xff]).unwrap();
        assert_eq!(outcome.consumed_bits, 40);
        assert_eq!(tree.get(len).cracked_value(), Some(&Value::Integer(3)));
        assert_eq!(tree.get(data).default_value, Some(Value::Bits(BitBuffer::from_bytes(&[1, 2, 3]))));
        assert_eq!(tree.get(tail).default_value, Some(Value::Integer(0xff)));

        let rendered = render(&mut tree).unwrap();
        assert_eq!(rendered.bytes(), &[3, 1, 2, 3, 0xff]);
    }

    #[test]
    fn unsized_blob_takes_the_rest_before_static_siblings() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let data = tree.append_child(root, Element::blob("data", None));
        let crc = tree.append_child(root, Element::number("crc", 16, false, Endian::Big));
        crack(&mut tree, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(tree.get(data).default_value, Some(Value::Bits(BitBuffer::from_bytes(&[1, 2, 3]))));
        assert_eq!(tree.get(crc).default_value, Some(Value::Integer(0x0405)));
    }

    #[test]
    fn token_after_unsized_string_ends_it() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let key = tree.append_child(root, Element::string("key", StringSpec::default()));
        let mut sep = Element::string("sep", StringSpec::default()).with_value(Value::Text(": ".into()));
        sep.token = true;
        tree.append_child(root, sep);
        let value = tree.append_child(root, Element::string("value", StringSpec::default()));

        crack(&mut tree, b"Host: example").unwrap();
        assert_eq!(cracked_text(&tree, key), "Host");
        assert_eq!(cracked_text(&tree, value), "example");
    }

    #[test]
    fn token_mismatch_reports_path_and_offset() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        tree.append_child(root, Element::number("a", 8, false, Endian::Big));
        let mut magic = Element::number("magic", 8, false, Endian::Big).with_value(Value::Integer(0x7f));
        magic.token = true;
        tree.append_child(root, magic);

        let err = crack(&mut tree, &[0, 0x45]).unwrap_err();
        assert_eq!(err.path, "Model.magic");
        assert_eq!(err.bit_offset, 8);
        assert!(matches!(err.kind, CrackFailure::TokenMismatch { .. }));
    }

    #[test]
    fn choice_picks_first_matching_alternative() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let choice = tree.add_detached(root, Element::new("c", ElementKind::Choice(Default::default())));
        let mut alternatives = Vec::new();
        for (name, tag) in [("a", 1), ("b", 2)] {
            let alt = tree.add_detached(choice, Element::block(name));
            let mut token = Element::number("tag", 8, false, Endian::Big).with_value(Value::Integer(tag));
            token.token = true;
            tree.append_child(alt, token);
            tree.append_child(alt, Element::number("body", 8, false, Endian::Big));
            alternatives.push(alt);
        }
        if let ElementKind::Choice(state) = &mut tree.get_mut(choice).kind {
            state.alternatives = alternatives;
        }
        tree.attach(root, choice, None);

        crack(&mut tree, &[2, 9]).unwrap();
        assert_eq!(tree.selected_index(choice), Some(1));
        let selected = tree.selected(choice).unwrap();
        let body = tree.find_child(selected, "body").unwrap();
        assert_eq!(tree.get(body).default_value, Some(Value::Integer(9)));

        let err = crack(&mut tree, &[3, 9]).unwrap_err();
        match err.kind {
            CrackFailure::NoMatchingAlternative { tried, deepest } => {
                assert_eq!(tried, 2);
                assert!(deepest.is_some());
            }
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(tree.selected(choice), None);
    }

    #[test]
    fn unbounded_array_consumes_until_exhausted() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let array = array_of(&mut tree, root, Element::number("item", 16, false, Endian::Big), 0, None);
        crack(&mut tree, &[0, 1, 0, 2, 0, 3]).unwrap();
        assert_eq!(tree.instance_count(array), 3);
        let names: Vec<&str> = tree.children(array).iter().map(|c| tree.name(*c)).collect();
        assert_eq!(names, ["item_0", "item_1", "item_2"]);
    }

    #[test]
    fn count_relation_drives_array_and_checks_bounds() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let count = tree.append_child(root, Element::number("count", 8, false, Endian::Big));
        let array = array_of(&mut tree, root, Element::number("item", 8, false, Endian::Big), 0, Some(4));
        let rest = tree.append_child(root, Element::blob("rest", None));
        tree.add_relation(Relation::new(RelationKind::Count, count, array));

        crack(&mut tree, &[2, 10, 20, 30]).unwrap();
        assert_eq!(tree.instance_count(array), 2);
        assert_eq!(tree.get(rest).default_value, Some(Value::Bits(BitBuffer::from_bytes(&[30]))));

        let err = crack(&mut tree, &[9, 1, 2, 3]).unwrap_err();
        assert!(matches!(err.kind, CrackFailure::CountOutOfRange { count: 9, .. }));
    }

    #[test]
    fn array_below_minimum_fails() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        array_of(&mut tree, root, Element::number("item", 16, false, Endian::Big), 3, None);
        let err = crack(&mut tree, &[0, 1, 0, 2]).unwrap_err();
        assert!(matches!(err.kind, CrackFailure::OutOfData { .. }), "got {err}");
    }

    #[test]
    fn padding_consumes_alignment_filler() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        tree.append_child(root, Element::number("a", 8, false, Endian::Big));
        tree.append_child(
            root,
            Element::padding(
                "pad",
                PaddingSpec {
                    alignment: 32,
                    ..PaddingSpec::default()
                },
            ),
        );
        let b = tree.append_child(root, Element::number("b", 8, false, Endian::Big));
        crack(&mut tree, &[1, 0, 0, 0, 7]).unwrap();
        assert_eq!(tree.get(b).default_value, Some(Value::Integer(7)));
    }

    #[test]
    fn null_terminated_string_stops_at_terminator() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let name = tree.append_child(
            root,
            Element::string(
                "name",
                StringSpec {
                    null_terminated: true,
                    ..StringSpec::default()
                },
            ),
        );
        let after = tree.append_child(root, Element::number("after", 8, false, Endian::Big));
        crack(&mut tree, b"abc\0\x05").unwrap();
        assert_eq!(cracked_text(&tree, name), "abc");
        assert_eq!(tree.get(after).default_value, Some(Value::Integer(5)));
    }

    #[test]
    fn constraint_rejects_values() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let mut version = Element::number("version", 8, false, Endian::Big);
        version.constraint = Some("value < 3".into());
        tree.append_child(root, version);
        assert!(crack(&mut tree, &[2]).is_ok());
        let err = crack(&mut tree, &[5]).unwrap_err();
        assert!(matches!(err.kind, CrackFailure::ConstraintFailed { .. }));
    }

    #[test]
    fn strict_trailing_rejects_leftovers() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        tree.append_child(root, Element::number("a", 8, false, Endian::Big));
        let settings = CrackSettings {
            strict_trailing: true,
            ..CrackSettings::default()
        };
        let err = Cracker::new(&ExprEvaluator, settings)
            .crack(&mut tree, &[1, 2])
            .unwrap_err();
        assert!(matches!(err.kind, CrackFailure::TrailingData { remaining: 8 }));
        assert_eq!(crack(&mut tree, &[1, 2]).unwrap().remaining_bits, 8);
    }

    #[test]
    fn offset_relation_skips_to_target() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let offset = tree.append_child(root, Element::number("offset", 8, false, Endian::Big));
        let body = tree.append_child(root, Element::number("body", 8, false, Endian::Big));
        tree.add_relation(Relation::new(RelationKind::Offset, offset, body));
        crack(&mut tree, &[3, 0, 0, 0x42]).unwrap();
        assert_eq!(tree.get(body).default_value, Some(Value::Integer(0x42)));

        let err = crack(&mut tree, &[0, 0x42]).unwrap_err();
        assert!(matches!(err.kind, CrackFailure::OffsetBehind { target: 0 }));
    }

    #[test]
    fn oversized_size_value_fails_cleanly() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let len = tree.append_child(root, Element::number("len", 64, false, Endian::Big));
        let data = tree.append_child(root, Element::blob("data", None));
        tree.add_relation(Relation::new(RelationKind::Size, len, data));

        let err = crack(&mut tree, &[0xff; 8]).unwrap_err();
        assert_eq!(err.path, "Model.data");
        assert!(matches!(err.kind, CrackFailure::InvalidRelationValue(_)));
    }

    #[test]
    fn oversized_offset_value_fails_cleanly() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let offset = tree.append_child(root, Element::number("offset", 64, false, Endian::Big));
        let body = tree.append_child(root, Element::number("body", 8, false, Endian::Big));
        tree.add_relation(Relation::new(RelationKind::Offset, offset, body));

        let err = crack(&mut tree, &[0xff; 9]).unwrap_err();
        assert!(matches!(err.kind, CrackFailure::InvalidRelationValue(_)));
    }

    #[test]
    fn huge_gap_before_token_runs_out_of_data() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let len = tree.append_child(root, Element::number("len", 64, false, Endian::Big));
        tree.append_child(root, Element::blob("head", None));
        let body = tree.append_child(root, Element::blob("body", None));
        let mut end = Element::number("end", 8, false, Endian::Big).with_value(Value::Integer(0x7f));
        end.token = true;
        tree.append_child(root, end);
        let mut relation = Relation::new(RelationKind::Size, len, body);
        relation.length_type = LengthType::Bits;
        tree.add_relation(relation);

        let err = crack(&mut tree, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xf0, 1, 0x7f]).unwrap_err();
        assert_eq!(err.path, "Model.head");
        assert!(matches!(err.kind, CrackFailure::OutOfData { .. }));
    }

    #[test]
    fn counted_unbounded_array_respects_the_occurrence_cap() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let count = tree.append_child(root, Element::number("count", 32, false, Endian::Big));
        let array = array_of(&mut tree, root, Element::block("entry"), 0, None);
        tree.add_relation(Relation::new(RelationKind::Count, count, array));
        let cracker = Cracker::new(
            &ExprEvaluator,
            CrackSettings {
                max_array_occurs: 16,
                strict_trailing: false,
            },
        );

        cracker.crack(&mut tree, &[0, 0, 0, 3]).unwrap();
        assert_eq!(tree.instance_count(array), 3);

        let err = cracker.crack(&mut tree, &[0, 0, 1, 0]).unwrap_err();
        assert_eq!(err.path, "Model.entry");
        assert!(matches!(
            err.kind,
            CrackFailure::CountOutOfRange {
                count: 256,
                min: 0,
                max: 16
            }
        ));
    }
}

//! Builds element trees from definitions.
//!
//! Occurrence attributes wrap the element in an array whose original is the
//! element itself. Relations are bound after the whole tree exists so they
//! can point forwards, and the finished tree is checked for flag overlaps,
//! dangling padding anchors and unknown fixups before it is handed out.

use crate::array::ArrayState;
use crate::bits::BitBuffer;
use crate::def::{DefKind, ElementDef, RelationDef};
use crate::element::{Element, ElementId, ElementKind};
use crate::error::{DocumentError, ValueError};
use crate::fixup::FixupRegistry;
use crate::flags;
use crate::padding;
use crate::relation::Relation;
use crate::render::encode_leaf;
use crate::script::{Evaluator, ExprEvaluator, Scope};
use crate::tree::DataTree;
use crate::value::{Value, ValueType, bytes_to_integer, check_range, parse_integer, raw_bytes};
use log::debug;
use std::collections::HashSet;

pub struct ModelBuilder<'a> {
    evaluator: &'a dyn Evaluator,
    fixups: &'a FixupRegistry,
}

/// Builds `def` with the default evaluator and built-in fixups.
pub fn build_model(def: &ElementDef) -> Result<DataTree, DocumentError> {
    let fixups = FixupRegistry::with_builtins();
    ModelBuilder::new(&ExprEvaluator, &fixups).build(def)
}

impl<'a> ModelBuilder<'a> {
    pub fn new(evaluator: &'a dyn Evaluator, fixups: &'a FixupRegistry) -> Self {
        Self { evaluator, fixups }
    }

    pub fn build(&self, def: &ElementDef) -> Result<DataTree, DocumentError> {
        let mut tree = DataTree::new(def.name.clone());
        let root = tree.root();
        {
            let element = tree.get_mut(root);
            element.hints = def.hints.clone();
            element.mutable = def.mutable;
            element.field_id = def.field_id.clone();
            element.fixup = def.fixup.clone();
        }
        let mut pending = Vec::new();
        for child in &def.children {
            self.add(&mut tree, root, child, true, &mut pending)?;
        }
        for (measurer, relation) in pending {
            bind_relation(&mut tree, measurer, &relation)?;
        }
        self.validate(&tree)?;
        debug!(
            "built model {} with {} element(s) and {} relation(s)",
            def.name,
            tree.live_count(),
            tree.relations().len()
        );
        Ok(tree)
    }

    fn add(
        &self,
        tree: &mut DataTree,
        parent: ElementId,
        def: &ElementDef,
        attach: bool,
        pending: &mut Vec<(ElementId, RelationDef)>,
    ) -> Result<ElementId, DocumentError> {
        if attach && tree.find_child(parent, &def.name).is_some() {
            return Err(DocumentError::DuplicateName {
                path: tree.full_name(parent),
                name: def.name.clone(),
            });
        }

        let id = match &def.occurs {
            Some(occurs) => {
                let mut wrapper = Element::block(def.name.clone());
                wrapper.hints = def.hints.clone();
                wrapper.mutable = def.mutable;
                wrapper.field_id = def.field_id.clone();
                let array = tree.add_detached(parent, wrapper);

                let mut template = def.template();
                template.field_id = None;
                let original = self.add(tree, array, &template, false, pending)?;
                let mut state = ArrayState::new(original, occurs.min, occurs.max, occurs.occurs);
                for (index, instance) in &occurs.instances {
                    let mut instance = instance.template();
                    instance.field_id = None;
                    let id = self.add(tree, array, &instance, false, pending)?;
                    state.instance_templates.insert(*index, id);
                }
                tree.get_mut(array).kind = ElementKind::Array(state);
                array
            }
            None => {
                let path = format!("{}.{}", tree.full_name(parent), def.name);
                let element = self.element(def, &path)?;
                let id = tree.add_detached(parent, element);
                pending.extend(def.relations.iter().map(|r| (id, r.clone())));

                if def.kind == DefKind::Choice {
                    let mut seen = HashSet::new();
                    let mut alternatives = Vec::new();
                    for child in &def.children {
                        if !seen.insert(child.name.as_str()) {
                            return Err(DocumentError::DuplicateName {
                                path: path.clone(),
                                name: child.name.clone(),
                            });
                        }
                        alternatives.push(self.add(tree, id, child, false, pending)?);
                    }
                    if let ElementKind::Choice(state) = &mut tree.get_mut(id).kind {
                        state.alternatives = alternatives;
                    }
                } else {
                    for child in &def.children {
                        self.add(tree, id, child, true, pending)?;
                    }
                }
                id
            }
        };
        if attach {
            tree.attach(parent, id, None);
        }
        Ok(id)
    }

    fn element(&self, def: &ElementDef, path: &str) -> Result<Element, DocumentError> {
        let kind = match &def.kind {
            DefKind::Block => ElementKind::Block,
            DefKind::Choice => ElementKind::Choice(Default::default()),
            DefKind::Number(spec) => ElementKind::Number(*spec),
            DefKind::String(spec) => ElementKind::String(spec.clone()),
            DefKind::Blob(spec) => ElementKind::Blob(*spec),
            DefKind::Double(spec) => ElementKind::Double(*spec),
            DefKind::Flags(spec) => ElementKind::Flags(*spec),
            DefKind::Flag(spec) => ElementKind::Flag(*spec),
            DefKind::Padding(spec) => ElementKind::Padding(spec.clone()),
            DefKind::Stream(spec) => ElementKind::Stream(spec.clone()),
        };
        let mut element = Element::new(def.name.clone(), kind);
        element.hints = def.hints.clone();
        element.mutable = def.mutable;
        element.field_id = def.field_id.clone();
        element.value_type = def.value_type;
        element.token = def.token;
        element.constraint = def.constraint.clone();
        element.fixup = def.fixup.clone();
        if let Some(text) = &def.value {
            element.default_value = Some(self.literal(&element.kind, text, def.value_type, path)?);
        }
        Ok(element)
    }

    /// Interprets a `value` attribute for an element kind.
    pub fn literal(
        &self,
        kind: &ElementKind,
        text: &str,
        value_type: ValueType,
        path: &str,
    ) -> Result<Value, DocumentError> {
        self.interpret(kind, text, value_type, path, true)
    }

    /// Like [`literal`](Self::literal) but lets the value run past the
    /// declared length, for run-time field overrides.
    pub fn field_value(
        &self,
        kind: &ElementKind,
        text: &str,
        value_type: ValueType,
        path: &str,
    ) -> Result<Value, DocumentError> {
        self.interpret(kind, text, value_type, path, false)
    }

    fn interpret(
        &self,
        kind: &ElementKind,
        text: &str,
        value_type: ValueType,
        path: &str,
        fit_declared: bool,
    ) -> Result<Value, DocumentError> {
        let invalid = |err: ValueError| DocumentError::InvalidValue {
            path: path.to_string(),
            reason: err.to_string(),
        };
        let value = if value_type == ValueType::Literal {
            self.evaluator
                .evaluate(text, &Scope::new())
                .map_err(|source| DocumentError::Script {
                    path: path.to_string(),
                    source,
                })?
        } else {
            parse_literal(kind, text, value_type).map_err(invalid)?
        };
        check_literal(kind, &value, fit_declared).map_err(invalid)?;
        Ok(value)
    }

    fn validate(&self, tree: &DataTree) -> Result<(), DocumentError> {
        for id in tree.subtree(tree.root()) {
            match tree.kind(id) {
                ElementKind::Flags(_) => flags::validate(tree, id)?,
                ElementKind::Padding(_) => padding::validate(tree, id)?,
                ElementKind::Flag(_) => {
                    let in_flags = tree
                        .parent(id)
                        .is_some_and(|p| matches!(tree.kind(p), ElementKind::Flags(_)));
                    if !in_flags {
                        return Err(DocumentError::UnknownElement {
                            path: tree.full_name(id),
                            tag: "Flag".into(),
                        });
                    }
                }
                _ => {}
            }
            let Some(spec) = &tree.get(id).fixup else {
                continue;
            };
            let fixup = self
                .fixups
                .get(&spec.class)
                .ok_or_else(|| DocumentError::UnknownFixup {
                    path: tree.full_name(id),
                    class: spec.class.clone(),
                })?;
            for param in fixup.ref_params() {
                if let Some(reference) = spec.params.get(*param) {
                    if tree.resolve(id, reference).is_none() {
                        return Err(DocumentError::UnresolvedRef {
                            path: tree.full_name(id),
                            reference: reference.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn bind_relation(
    tree: &mut DataTree,
    measurer: ElementId,
    def: &RelationDef,
) -> Result<(), DocumentError> {
    let lookup = |tree: &DataTree, name: &str| {
        tree.resolve(measurer, name)
            .ok_or_else(|| DocumentError::UnresolvedRelation {
                path: tree.full_name(measurer),
                of: name.to_string(),
            })
    };
    let target = lookup(tree, &def.of)?;
    let relative_to = match &def.relative_to {
        Some(name) => Some(lookup(tree, name)?),
        None => None,
    };
    let mut relation = Relation::new(def.kind, measurer, target);
    relation.length_type = def.length_type;
    relation.expression_get = def.expression_get.clone();
    relation.expression_set = def.expression_set.clone();
    relation.relative = def.relative;
    relation.relative_to = relative_to;
    tree.add_relation(relation);
    Ok(())
}

fn parse_literal(kind: &ElementKind, text: &str, value_type: ValueType) -> Result<Value, ValueError> {
    let raw = raw_bytes(text, value_type)?;
    Ok(match kind {
        ElementKind::Number(_) | ElementKind::Flag(_) => Value::Integer(match raw {
            Some(bytes) => bytes_to_integer(&bytes)?,
            None => parse_integer(text)?,
        }),
        ElementKind::Double(_) => Value::Float(Value::Text(text.to_string()).as_float()?),
        ElementKind::String(_) => match raw {
            Some(bytes) => Value::Bits(BitBuffer::from_bytes(&bytes)),
            None => Value::Text(text.to_string()),
        },
        ElementKind::Blob(_) => {
            Value::Bits(BitBuffer::from(raw.unwrap_or_else(|| text.as_bytes().to_vec())))
        }
        other => {
            return Err(ValueError::Mismatch {
                expected: "a value element",
                found: other.name(),
            });
        }
    })
}

/// Rejects values that cannot be encoded, and with `fit_declared` those that
/// exceed a declared length.
fn check_literal(kind: &ElementKind, value: &Value, fit_declared: bool) -> Result<(), ValueError> {
    if let ElementKind::Flag(flag) = kind {
        return check_range(value.as_integer()?, flag.size, false);
    }
    let bits = encode_leaf(kind, value)?;
    if !fit_declared {
        return Ok(());
    }
    let declared = match kind {
        ElementKind::Blob(spec) => spec.length_bits,
        ElementKind::String(spec) => spec.fixed_bits(),
        _ => None,
    };
    match declared {
        Some(declared) if bits.len_bits() > declared => Err(ValueError::TooLong {
            actual: bits.len_bits(),
            declared,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::OccursDef;
    use crate::element::{FlagSpec, FlagsSpec, NumberSpec, PaddingSpec, StringSpec};
    use crate::fixup::FixupSpec;
    use crate::relation::RelationKind;
    use crate::render::render;
    use crate::value::Endian;

    fn number(name: &str, size: u32) -> ElementDef {
        ElementDef::new(
            name,
            DefKind::Number(NumberSpec {
                size,
                signed: false,
                endian: Endian::Big,
            }),
        )
    }

    fn blob(name: &str, length_bits: Option<u64>) -> ElementDef {
        ElementDef::new(name, DefKind::Blob(crate::element::BlobSpec { length_bits }))
    }

    #[test]
    fn occurs_wraps_in_an_array_and_moves_field_id() {
        let mut item = number("item", 8).with_value("5").with_occurs(OccursDef::exactly(3));
        item.field_id = Some("items".into());
        item.hints.insert("NumericalString".into(), "true".into());
        let mut tree = build_model(&ElementDef::block("Model", vec![item])).unwrap();

        let array = tree.children(tree.root())[0];
        assert!(matches!(tree.kind(array), ElementKind::Array(_)));
        assert_eq!(tree.get(array).field_id.as_deref(), Some("items"));
        assert_eq!(tree.get(array).hints.get("NumericalString").map(String::as_str), Some("true"));
        let original = tree.array_original(array);
        assert_eq!(tree.get(original).field_id, None);
        assert!(!tree.is_expanded(array), "expansion waits for the first render");

        assert_eq!(render(&mut tree).unwrap().bytes(), &[5, 5, 5]);
        assert!(tree.is_expanded(array));
    }

    #[test]
    fn relations_bind_forwards() {
        let len = number("len", 8).with_relation(RelationDef::new(RelationKind::Size, "data"));
        let data = blob("data", None).with_value("hello");
        let mut tree = build_model(&ElementDef::block("Model", vec![len, data])).unwrap();
        assert_eq!(render(&mut tree).unwrap().bytes(), b"\x05hello");
    }

    #[test]
    fn unresolved_relation_is_a_document_error() {
        let len = number("len", 8).with_relation(RelationDef::new(RelationKind::Size, "nope"));
        let err = build_model(&ElementDef::block("Model", vec![len])).unwrap_err();
        assert!(
            matches!(err, DocumentError::UnresolvedRelation { ref path, ref of } if path == "Model.len" && of == "nope"),
            "got {err}"
        );
    }

    #[test]
    fn duplicate_sibling_names_are_rejected() {
        let err = build_model(&ElementDef::block("Model", vec![number("a", 8), number("a", 8)]))
            .unwrap_err();
        assert!(matches!(err, DocumentError::DuplicateName { .. }), "got {err}");
    }

    #[test]
    fn literal_checks() {
        let too_big = number("n", 8).with_value("256");
        let err = build_model(&ElementDef::block("Model", vec![too_big])).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidValue { .. }), "got {err}");

        let mut long = blob("b", Some(16)).with_value("aabbcc");
        long.value_type = ValueType::Hex;
        let err = build_model(&ElementDef::block("Model", vec![long])).unwrap_err();
        assert!(err.to_string().contains("longer than the declared"), "got {err}");

        let mut expr = number("n", 16);
        expr.value = Some("0x10 * 4".into());
        expr.value_type = ValueType::Literal;
        let mut tree = build_model(&ElementDef::block("Model", vec![expr])).unwrap();
        assert_eq!(render(&mut tree).unwrap().bytes(), &[0, 64]);

        let mut string = ElementDef::new("s", DefKind::String(StringSpec::default())).with_value("41 42");
        string.value_type = ValueType::Hex;
        let mut tree = build_model(&ElementDef::block("Model", vec![string])).unwrap();
        assert_eq!(render(&mut tree).unwrap().bytes(), b"AB");
    }

    #[test]
    fn structural_validation() {
        let mut flags = ElementDef::new(
            "f",
            DefKind::Flags(FlagsSpec {
                size: 8,
                endian: Endian::Big,
            }),
        );
        flags.children = vec![
            ElementDef::new("a", DefKind::Flag(FlagSpec { position: 0, size: 5 })),
            ElementDef::new("b", DefKind::Flag(FlagSpec { position: 4, size: 4 })),
        ];
        let err = build_model(&ElementDef::block("Model", vec![flags])).unwrap_err();
        assert!(matches!(err, DocumentError::FlagOverlap { .. }), "got {err}");

        let pad = ElementDef::new(
            "pad",
            DefKind::Padding(PaddingSpec {
                aligned_to: Some("ghost".into()),
                ..PaddingSpec::default()
            }),
        );
        let err = build_model(&ElementDef::block("Model", vec![pad])).unwrap_err();
        assert!(matches!(err, DocumentError::UnresolvedAnchor { .. }), "got {err}");

        let mut fixed = blob("sum", Some(128));
        fixed.fixup = Some(FixupSpec::new("Crc99"));
        let err = build_model(&ElementDef::block("Model", vec![fixed])).unwrap_err();
        assert!(matches!(err, DocumentError::UnknownFixup { .. }), "got {err}");

        let mut dangling = blob("sum", Some(128));
        dangling.fixup = Some(FixupSpec::new("Md5Fixup").with_param("ref", "missing"));
        let err = build_model(&ElementDef::block("Model", vec![dangling])).unwrap_err();
        assert!(matches!(err, DocumentError::UnresolvedRef { .. }), "got {err}");
    }

    #[test]
    fn choice_alternatives_stay_detached() {
        let mut choice = ElementDef::new("c", DefKind::Choice);
        choice.children = vec![number("a", 8).with_value("1"), number("b", 16).with_value("2")];
        let mut tree = build_model(&ElementDef::block("Model", vec![choice])).unwrap();
        let c = tree.children(tree.root())[0];
        assert_eq!(tree.alternatives(c).len(), 2);
        assert!(tree.children(c).is_empty());
        tree.select_defaults(tree.root());
        assert_eq!(render(&mut tree).unwrap().bytes(), &[1]);
    }
}

//! Run-time field overrides.
//!
//! A field names an element by dotted path from the model root. Indexed
//! segments grow the addressed array (`Items[3]`) or disable it (`Items[-1]`),
//! and a segment that names a choice alternative selects it.

use crate::build::ModelBuilder;
use crate::element::{ElementId, ElementKind};
use crate::error::DocumentError;
use crate::resolve::{PathSegment, parse_path};
use crate::tree::DataTree;
use crate::value::ValueType;
use log::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOverride {
    pub name: String,
    pub value: String,
    pub value_type: ValueType,
}

impl FieldOverride {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            value_type: ValueType::String,
        }
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }
}

/// Where a field path ended up.
enum Target {
    Element(ElementId),
    /// The alternative of a choice, just selected.
    Alternative(ElementId),
    /// An array set to zero instances.
    Disabled,
}

/// Applies each field in order.
pub fn apply_data_set(
    tree: &mut DataTree,
    builder: &ModelBuilder<'_>,
    fields: &[FieldOverride],
) -> Result<(), DocumentError> {
    for field in fields {
        apply_field(tree, builder, field)?;
    }
    Ok(())
}

/// Walks to the element `field.name` addresses and sets its override value.
///
/// Containers are walked through but never set. An empty value on a choice
/// alternative only selects it.
pub fn apply_field(
    tree: &mut DataTree,
    builder: &ModelBuilder<'_>,
    field: &FieldOverride,
) -> Result<(), DocumentError> {
    let segments = parse_path(&field.name).map_err(|reason| DocumentError::InvalidAttribute {
        path: tree.full_name(tree.root()),
        attribute: "name".into(),
        value: field.name.clone(),
        reason,
    })?;

    let id = match walk(tree, &segments)? {
        Target::Disabled => return Ok(()),
        Target::Alternative(_) if field.value.is_empty() => return Ok(()),
        Target::Element(id) | Target::Alternative(id) => id,
    };
    let path = tree.full_name(id);
    if tree.kind(id).is_container() {
        debug!("field {} addresses container {path}, nothing to set", field.name);
        return Ok(());
    }
    let value = builder.field_value(tree.kind(id), &field.value, field.value_type, &path)?;
    debug!("field {} = {value}", path);
    let element = tree.get_mut(id);
    element.override_value = Some(value);
    Ok(())
}

fn walk(tree: &mut DataTree, segments: &[PathSegment]) -> Result<Target, DocumentError> {
    let mut cursor = tree.root();
    let mut target = Target::Element(cursor);
    for (position, segment) in segments.iter().enumerate() {
        let no_such_child = |tree: &DataTree| DocumentError::NoSuchChild {
            path: tree.full_name(cursor),
            child: segment.name.clone(),
        };
        let (child, alternative) = if matches!(tree.kind(cursor), ElementKind::Choice(_)) {
            let index = tree
                .alternatives(cursor)
                .iter()
                .position(|a| tree.name(*a) == segment.name)
                .ok_or_else(|| no_such_child(tree))?;
            let selected = match tree.selected_index(cursor) {
                Some(current) if current == index => tree.selected(cursor),
                _ => None,
            };
            let child = match selected {
                Some(child) => child,
                None => tree.select(cursor, index),
            };
            (child, true)
        } else {
            let child = tree
                .find_child(cursor, &segment.name)
                .ok_or_else(|| no_such_child(tree))?;
            (child, false)
        };
        cursor = child;
        target = if alternative {
            Target::Alternative(child)
        } else {
            Target::Element(child)
        };

        let Some(index) = segment.index else {
            continue;
        };
        match instance(tree, child, segment, index)? {
            Some(instance) => {
                cursor = instance;
                target = Target::Element(instance);
            }
            None if position + 1 == segments.len() => return Ok(Target::Disabled),
            None => {
                return Err(DocumentError::InvalidIndex {
                    path: tree.full_name(child),
                    segment: segment.name.clone(),
                    index,
                    reason: "a disabled array has no children to address".into(),
                });
            }
        }
    }
    Ok(target)
}

/// Materializes instance `index` of `array`, or disables it for `-1`.
fn instance(
    tree: &mut DataTree,
    array: ElementId,
    segment: &PathSegment,
    index: i64,
) -> Result<Option<ElementId>, DocumentError> {
    if !matches!(tree.kind(array), ElementKind::Array(_)) {
        return Err(DocumentError::NotAnArray {
            path: tree.full_name(array),
            segment: segment.name.clone(),
        });
    }
    let invalid = |tree: &DataTree, reason: &str| DocumentError::InvalidIndex {
        path: tree.full_name(array),
        segment: segment.name.clone(),
        index,
        reason: reason.to_string(),
    };
    let state = tree.array_state(array);
    if index == -1 {
        if state.min_occurs > 0 {
            return Err(invalid(tree, "cannot disable an array with minOccurs above zero"));
        }
        tree.expand_to(array, 0);
        return Ok(None);
    }
    let index = usize::try_from(index).map_err(|_| invalid(tree, "index must not be negative"))?;
    if state.max_occurs.is_some_and(|max| index >= max as usize) {
        return Err(invalid(tree, "index exceeds maxOccurs"));
    }
    if !tree.is_expanded(array) || tree.instance_count(array) <= index {
        tree.expand_to(array, index + 1);
    }
    Ok(Some(tree.children(array)[index]))
}

impl DataTree {
    /// The dot-joined field ids of `id` and its ancestors, outermost first.
    pub fn full_field_id(&self, id: ElementId) -> Option<String> {
        let mut ids: Vec<&str> = std::iter::once(id)
            .chain(self.ancestors(id))
            .filter_map(|e| self.get(e).field_id.as_deref())
            .collect();
        if ids.is_empty() {
            return None;
        }
        ids.reverse();
        Some(ids.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{DefKind, ElementDef, OccursDef};
    use crate::element::{NumberSpec, StringSpec};
    use crate::fixup::FixupRegistry;
    use crate::render::render;
    use crate::script::ExprEvaluator;
    use crate::value::{Endian, Value};

    fn number(name: &str) -> ElementDef {
        ElementDef::new(
            name,
            DefKind::Number(NumberSpec {
                size: 8,
                signed: false,
                endian: Endian::Big,
            }),
        )
        .with_value("0")
    }

    fn apply(tree: &mut DataTree, fields: &[FieldOverride]) -> Result<(), DocumentError> {
        let fixups = FixupRegistry::with_builtins();
        let builder = ModelBuilder::new(&ExprEvaluator, &fixups);
        apply_data_set(tree, &builder, fields)
    }

    fn model() -> DataTree {
        let items = ElementDef::block("Items", vec![number("a"), number("b")]).with_occurs(OccursDef {
            min: 0,
            max: Some(4),
            occurs: 1,
            instances: Default::default(),
        });
        let mut choice = ElementDef::new("c", DefKind::Choice);
        choice.children = vec![
            number("x").with_value("1"),
            ElementDef::new("y", DefKind::String(StringSpec::default())).with_value("y"),
        ];
        let header = ElementDef::block("header", vec![number("version")]);
        crate::build::build_model(&ElementDef::block("Model", vec![header, items, choice])).unwrap()
    }

    #[test]
    fn sets_leaf_by_dotted_path() {
        let mut tree = model();
        apply(&mut tree, &[FieldOverride::new("header.version", "3")]).unwrap();
        let version = tree.resolve(tree.root(), "header.version").unwrap();
        assert_eq!(tree.get(version).override_value, Some(Value::Integer(3)));
    }

    #[test]
    fn indexed_field_grows_the_array() {
        let mut tree = model();
        apply(&mut tree, &[FieldOverride::new("Items[2].b", "9"), FieldOverride::new("c.x", "")])
            .unwrap();
        let items = tree.find_child(tree.root(), "Items").unwrap();
        assert_eq!(tree.instance_count(items), 3);
        let rendered = render(&mut tree).unwrap();
        assert_eq!(rendered.bytes(), &[0, 0, 0, 0, 0, 0, 9, 1]);
    }

    #[test]
    fn minus_one_disables_an_optional_array() {
        let mut tree = model();
        apply(&mut tree, &[FieldOverride::new("Items[-1]", ""), FieldOverride::new("c.y", "")])
            .unwrap();
        let rendered = render(&mut tree).unwrap();
        assert_eq!(rendered.bytes(), &[0, b'y']);
    }

    #[test]
    fn index_past_max_is_rejected() {
        let mut tree = model();
        let err = apply(&mut tree, &[FieldOverride::new("Items[4].a", "1")]).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidIndex { index: 4, .. }), "got {err}");
        let err = apply(&mut tree, &[FieldOverride::new("header[0]", "1")]).unwrap_err();
        assert!(matches!(err, DocumentError::NotAnArray { .. }), "got {err}");
    }

    #[test]
    fn choice_segment_selects_and_sets() {
        let mut tree = model();
        apply(&mut tree, &[FieldOverride::new("c.y", "hello")]).unwrap();
        let c = tree.find_child(tree.root(), "c").unwrap();
        assert_eq!(tree.selected_index(c), Some(1));
        apply(&mut tree, &[FieldOverride::new("c.y", "")]).unwrap();
        let y = tree.selected(c).unwrap();
        assert_eq!(
            tree.get(y).override_value,
            Some(Value::Text("hello".into())),
            "reselecting the same alternative keeps its value"
        );
    }

    #[test]
    fn hex_field_and_unknown_child() {
        let mut tree = model();
        let field = FieldOverride::new("header.version", "7f").with_value_type(ValueType::Hex);
        apply(&mut tree, &[field]).unwrap();
        let version = tree.resolve(tree.root(), "header.version").unwrap();
        assert_eq!(tree.get(version).override_value, Some(Value::Integer(0x7f)));

        let err = apply(&mut tree, &[FieldOverride::new("header.nope", "1")]).unwrap_err();
        assert!(
            matches!(err, DocumentError::NoSuchChild { ref path, ref child } if path == "Model.header" && child == "nope"),
            "got {err}"
        );
    }

    #[test]
    fn full_field_id_joins_ancestors() {
        let mut tree = model();
        let header = tree.find_child(tree.root(), "header").unwrap();
        let version = tree.find_child(header, "version").unwrap();
        assert_eq!(tree.full_field_id(version), None);
        tree.get_mut(header).field_id = Some("hdr".into());
        tree.get_mut(version).field_id = Some("ver".into());
        assert_eq!(tree.full_field_id(version).as_deref(), Some("hdr.ver"));
    }
}

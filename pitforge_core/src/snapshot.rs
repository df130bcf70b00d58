//! Serializable views of a populated tree.

use crate::element::{ElementId, ElementKind};
use crate::render::Rendered;
use crate::tree::DataTree;
use serde::Serialize;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TreeSnapshot {
    pub name: String,
    pub kind: &'static str,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Hex of the element's rendered bits, when captured against a render.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    pub mutable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeSnapshot>,
}

impl TreeSnapshot {
    /// Snapshot of the in-scope subtree at `id`.
    pub fn capture(tree: &DataTree, id: ElementId) -> Self {
        Self::build(tree, id, None)
    }

    /// Like [`capture`](Self::capture), with each element's rendered bits.
    pub fn capture_rendered(tree: &DataTree, id: ElementId, rendered: &Rendered) -> Self {
        Self::build(tree, id, Some(rendered))
    }

    fn build(tree: &DataTree, id: ElementId, rendered: Option<&Rendered>) -> Self {
        let element = tree.get(id);
        let kind = &element.kind;
        let value = match kind {
            ElementKind::Number(_)
            | ElementKind::String(_)
            | ElementKind::Blob(_)
            | ElementKind::Double(_)
            | ElementKind::Flag(_) => element.current_value().map(ToString::to_string),
            _ => None,
        };
        Self {
            name: element.name.clone(),
            kind: kind.name(),
            full_name: tree.full_name(id),
            value,
            bits: rendered
                .and_then(|r| r.element_bits(id))
                .map(|bits| bits.to_hex()),
            field_id: tree.full_field_id(id),
            mutable: tree.is_mutable(id),
            children: tree
                .children(id)
                .iter()
                .map(|c| Self::build(tree, *c, rendered))
                .collect(),
        }
    }

    /// Every snapshot in document order, this one first.
    pub fn flatten(&self) -> Vec<&TreeSnapshot> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, StringSpec};
    use crate::render::render;
    use crate::value::{Endian, Value};

    #[test]
    fn captures_values_and_bits() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let header = tree.append_child(root, Element::block("header"));
        tree.append_child(
            header,
            Element::number("n", 16, false, Endian::Big).with_value(Value::Integer(258)),
        );
        tree.append_child(
            root,
            Element::string("s", StringSpec::default()).with_value(Value::Text("hi".into())),
        );
        let rendered = render(&mut tree).unwrap();

        let snapshot = TreeSnapshot::capture_rendered(&tree, root, &rendered);
        let all = snapshot.flatten();
        assert_eq!(all.len(), 4);
        assert_eq!(all[2].full_name, "Model.header.n");
        assert_eq!(all[2].value.as_deref(), Some("258"));
        assert_eq!(all[2].bits.as_deref(), Some("0102"));
        assert_eq!(all[3].value.as_deref(), Some("hi"));
        assert_eq!(all[1].value, None, "containers carry no value");

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["children"][0]["kind"], "Block");
        assert!(json.get("value").is_none());
    }
}

//! Repeating elements.
//!
//! An array keeps its template (`original`) outside of its children and
//! materializes indexed clones of it on demand. Expansion is an explicit
//! state on the node so it happens once and can be observed.

use crate::element::{ElementId, ElementKind};
use crate::tree::DataTree;
use log::debug;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expansion {
    #[default]
    Unexpanded,
    Expanded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayState {
    pub original: ElementId,
    /// Replacement templates for specific indexes, created by indexed overrides.
    pub instance_templates: BTreeMap<u32, ElementId>,
    pub min_occurs: u32,
    /// `None` means unbounded.
    pub max_occurs: Option<u32>,
    /// Instance count used when rendering without a count override.
    pub occurs: u32,
    pub expansion: Expansion,
}

impl ArrayState {
    pub fn new(original: ElementId, min_occurs: u32, max_occurs: Option<u32>, occurs: u32) -> Self {
        Self {
            original,
            instance_templates: BTreeMap::new(),
            min_occurs,
            max_occurs,
            occurs,
            expansion: Expansion::Unexpanded,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.max_occurs == Some(self.min_occurs)
    }
}

impl DataTree {
    pub fn array_state(&self, array: ElementId) -> &ArrayState {
        match &self.get(array).kind {
            ElementKind::Array(state) => state,
            other => panic!("{} is a {}, not an array", self.full_name(array), other.name()),
        }
    }

    fn array_state_mut(&mut self, array: ElementId) -> &mut ArrayState {
        let path = self.full_name(array);
        match &mut self.get_mut(array).kind {
            ElementKind::Array(state) => state,
            other => panic!("{path} is a {}, not an array", other.name()),
        }
    }

    pub fn is_expanded(&self, array: ElementId) -> bool {
        self.array_state(array).expansion == Expansion::Expanded
    }

    pub fn array_original(&self, array: ElementId) -> ElementId {
        self.array_state(array).original
    }

    pub fn instance_count(&self, array: ElementId) -> usize {
        self.children(array).len()
    }

    /// Materializes the default instance count once; later calls do nothing.
    pub fn expand(&mut self, array: ElementId) {
        if self.is_expanded(array) {
            return;
        }
        let occurs = self.array_state(array).occurs as usize;
        self.expand_to(array, occurs);
    }

    /// Grows or shrinks the array to exactly `count` instances.
    pub fn expand_to(&mut self, array: ElementId, count: usize) {
        self.array_state_mut(array).expansion = Expansion::Expanded;
        while self.instance_count(array) > count {
            let last = self.children(array)[self.instance_count(array) - 1];
            self.remove(last);
        }
        let existing = self.instance_count(array);
        for index in existing..count {
            let instance = self.make_instance(array, index);
            self.attach(array, instance, None);
        }
        if count > existing {
            debug!(
                "expanded {} to {count} instance(s)",
                self.full_name(array)
            );
        }
    }

    /// Clones the template for `index` as a detached instance named
    /// `<original>_<index>`.
    pub fn make_instance(&mut self, array: ElementId, index: usize) -> ElementId {
        let state = self.array_state(array);
        let template = u32::try_from(index)
            .ok()
            .and_then(|i| state.instance_templates.get(&i).copied())
            .unwrap_or(state.original);
        let name = format!("{}_{index}", self.name(state.original));
        self.clone_detached(template, array, Some(&name))
    }

    /// Removes every instance and marks the array unexpanded again.
    pub fn clear_instances(&mut self, array: ElementId) {
        for instance in self.children(array).to_vec() {
            self.remove(instance);
        }
        self.array_state_mut(array).expansion = Expansion::Unexpanded;
    }

    /// Expands every unexpanded array in scope below `id`, including arrays
    /// that only appear inside freshly created instances.
    pub fn expand_all(&mut self, id: ElementId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if matches!(self.kind(next), ElementKind::Array(_)) {
                self.expand(next);
            }
            stack.extend(self.children(next).iter().rev().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::relation::{Relation, RelationKind};
    use crate::value::Endian;

    fn array_of_blocks(tree: &mut DataTree, occurs: u32) -> ElementId {
        let root = tree.root();
        let array = tree.add_detached(root, Element::new("Items", ElementKind::Block));
        let original = tree.add_detached(array, Element::block("Items"));
        let len = tree.append_child(original, Element::number("len", 8, false, Endian::Big));
        let data = tree.append_child(original, Element::blob("data", None));
        tree.add_relation(Relation::new(RelationKind::Size, len, data));
        tree.get_mut(array).kind =
            ElementKind::Array(ArrayState::new(original, occurs, Some(occurs), occurs));
        tree.attach(root, array, None);
        array
    }

    #[test]
    fn expansion_is_lazy_and_idempotent() {
        let mut tree = DataTree::new("Model");
        let array = array_of_blocks(&mut tree, 3);
        assert!(!tree.is_expanded(array));
        assert_eq!(tree.instance_count(array), 0);

        tree.expand(array);
        assert!(tree.is_expanded(array));
        let names: Vec<_> = tree
            .children(array)
            .iter()
            .map(|c| tree.name(*c).to_string())
            .collect();
        assert_eq!(names, ["Items_0", "Items_1", "Items_2"]);

        tree.expand(array);
        assert_eq!(tree.instance_count(array), 3, "second expand is a no-op");
    }

    #[test]
    fn instances_get_their_own_relations() {
        let mut tree = DataTree::new("Model");
        let array = array_of_blocks(&mut tree, 2);
        tree.expand(array);
        for instance in tree.children(array).to_vec() {
            let len = tree.find_child(instance, "len").unwrap();
            let data = tree.find_child(instance, "data").unwrap();
            assert_eq!(tree.effective_relation(len).unwrap().target, data);
        }
        tree.expand_to(array, 1);
        assert_eq!(tree.relations().len(), 2, "template edge plus one instance edge");
    }

    #[test]
    fn zero_occurs_yields_no_instances() {
        let mut tree = DataTree::new("Model");
        let array = array_of_blocks(&mut tree, 0);
        tree.expand(array);
        assert!(tree.is_expanded(array));
        assert_eq!(tree.instance_count(array), 0);
    }

    #[test]
    fn instance_templates_replace_the_original_at_their_index() {
        let mut tree = DataTree::new("Model");
        let array = array_of_blocks(&mut tree, 2);
        let special = tree.add_detached(array, Element::blob("Items", Some(8)));
        if let ElementKind::Array(state) = &mut tree.get_mut(array).kind {
            state.instance_templates.insert(1, special);
        }
        tree.expand(array);
        let second = tree.children(array)[1];
        assert_eq!(tree.name(second), "Items_1");
        assert!(matches!(tree.kind(second), ElementKind::Blob(_)));
    }

    #[test]
    fn renaming_a_clone_renames_original_and_instances() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let array = array_of_blocks(&mut tree, 2);
        tree.expand(array);
        let copy = tree.clone_detached(array, root, Some("Other"));
        tree.attach(root, copy, None);

        let names: Vec<_> = tree
            .children(copy)
            .iter()
            .map(|c| tree.name(*c).to_string())
            .collect();
        assert_eq!(names, ["Other_0", "Other_1"]);
        assert_eq!(tree.name(tree.array_original(copy)), "Other");
        assert_eq!(tree.name(tree.array_original(array)), "Items");
        assert_ne!(tree.array_original(copy), tree.array_original(array));
        assert_eq!(tree.name(tree.children(array)[0]), "Items_0");
    }
}

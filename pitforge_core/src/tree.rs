//! The element arena.
//!
//! Nodes live in a flat vector addressed by [`ElementId`]. Parent links,
//! array originals, choice alternatives and relation endpoints are all plain
//! ids, so removing a subtree is a walk that frees slots and purges the
//! relation index in the same call.

use crate::element::{Element, ElementId, ElementKind};
use crate::relation::{Relation, RelationId, RelationIndex, RelationKind};
use log::trace;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DataTree {
    nodes: Vec<Option<Element>>,
    relations: RelationIndex,
    root: ElementId,
}

impl DataTree {
    /// Creates a tree holding a single, empty data model.
    pub fn new(model_name: impl Into<String>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            relations: RelationIndex::new(),
            root: ElementId(0),
        };
        tree.root = tree.alloc(Element::new(model_name, ElementKind::Model));
        tree
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn relations(&self) -> &RelationIndex {
        &self.relations
    }

    fn alloc(&mut self, element: Element) -> ElementId {
        let id = ElementId(self.nodes.len());
        self.nodes.push(Some(element));
        id
    }

    pub fn contains(&self, id: ElementId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    pub fn get(&self, id: ElementId) -> &Element {
        match self.nodes.get(id.0).and_then(Option::as_ref) {
            Some(element) => element,
            None => panic!("element {id} was removed but is still referenced"),
        }
    }

    pub fn get_mut(&mut self, id: ElementId) -> &mut Element {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(element) => element,
            None => panic!("element {id} was removed but is still referenced"),
        }
    }

    pub fn kind(&self, id: ElementId) -> &ElementKind {
        &self.get(id).kind
    }

    pub fn name(&self, id: ElementId) -> &str {
        &self.get(id).name
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.get(id).parent
    }

    pub fn children(&self, id: ElementId) -> &[ElementId] {
        &self.get(id).children
    }

    /// Number of live nodes, including array originals and choice alternatives.
    pub fn live_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    fn assert_unique_child_name(&self, parent: ElementId, name: &str, except: Option<ElementId>) {
        let clash = self
            .children(parent)
            .iter()
            .any(|c| Some(*c) != except && self.name(*c) == name);
        assert!(
            !clash,
            "duplicate full name {}.{name}",
            self.full_name(parent)
        );
    }

    /// Appends `element` as the last child of `parent`.
    pub fn append_child(&mut self, parent: ElementId, element: Element) -> ElementId {
        let id = self.add_detached(parent, element);
        self.attach(parent, id, None);
        id
    }

    /// Creates a node owned by `parent` that is not part of its children,
    /// such as an array template or a choice alternative.
    pub fn add_detached(&mut self, parent: ElementId, mut element: Element) -> ElementId {
        element.parent = Some(parent);
        element.children.clear();
        self.alloc(element)
    }

    /// Makes an owned, detached node a child of its parent, at `index` or at the end.
    pub fn attach(&mut self, parent: ElementId, id: ElementId, index: Option<usize>) {
        assert_eq!(
            self.parent(id),
            Some(parent),
            "attach of {id} under a foreign parent"
        );
        let name = self.name(id).to_string();
        self.assert_unique_child_name(parent, &name, Some(id));
        let children = &mut self.get_mut(parent).children;
        match index {
            Some(i) if i < children.len() => children.insert(i, id),
            _ => children.push(id),
        }
    }

    /// Every node owned by `id`: children plus kind-specific templates.
    pub fn owned(&self, id: ElementId) -> Vec<ElementId> {
        let element = self.get(id);
        let mut owned = element.children.clone();
        match &element.kind {
            ElementKind::Array(state) => {
                owned.push(state.original);
                owned.extend(state.instance_templates.values().copied());
            }
            ElementKind::Choice(state) => owned.extend(state.alternatives.iter().copied()),
            _ => {}
        }
        owned
    }

    /// Removes `id` and everything it owns, purging every relation edge that
    /// touches any removed node.
    pub fn remove(&mut self, id: ElementId) {
        assert!(id != self.root, "the model root cannot be removed");
        if let Some(parent) = self.parent(id) {
            let element = self.get_mut(parent);
            element.children.retain(|c| *c != id);
            match &mut element.kind {
                ElementKind::Choice(state) => {
                    state.alternatives.retain(|a| *a != id);
                    if state.selected.map(|(_, s)| s) == Some(id) {
                        state.selected = None;
                    }
                }
                ElementKind::Array(state) => {
                    assert!(state.original != id, "an array's original cannot be removed");
                    state.instance_templates.retain(|_, t| *t != id);
                }
                _ => {}
            }
        }
        self.free_subtree(id);
    }

    fn free_subtree(&mut self, id: ElementId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            stack.extend(self.owned(next));
            let purged = self.relations.purge_element(next);
            if purged > 0 {
                trace!("purged {purged} relation(s) touching {}", self.full_name(next));
            }
            self.nodes[next.0] = None;
        }
    }

    /// Renames `id`, keeping an array's original and instances in step.
    pub fn rename(&mut self, id: ElementId, new_name: &str) {
        if let Some(parent) = self.parent(id) {
            if self.children(parent).contains(&id) {
                self.assert_unique_child_name(parent, new_name, Some(id));
            }
        }
        self.rename_unchecked(id, new_name);
    }

    pub(crate) fn rename_unchecked(&mut self, id: ElementId, new_name: &str) {
        let old_name = std::mem::replace(&mut self.get_mut(id).name, new_name.to_string());
        let ElementKind::Array(state) = &self.get(id).kind else {
            return;
        };
        let original = state.original;
        let instances: Vec<(usize, ElementId)> =
            self.children(id).iter().copied().enumerate().collect();
        let templates: Vec<(u32, ElementId)> = state
            .instance_templates
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        if self.name(original) == old_name {
            self.rename_unchecked(original, new_name);
        }
        for (i, child) in instances {
            if self.name(child) == format!("{old_name}_{i}") {
                self.rename_unchecked(child, &format!("{new_name}_{i}"));
            }
        }
        for (_, template) in templates {
            if self.name(template) == old_name {
                self.rename_unchecked(template, new_name);
            }
        }
    }

    /// Dot-joined names from the model root down to `id`.
    pub fn full_name(&self, id: ElementId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            names.push(self.name(current));
            cursor = self.parent(current);
        }
        names.reverse();
        names.join(".")
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: ElementId) -> impl Iterator<Item = ElementId> + '_ {
        std::iter::successors(self.parent(id), |p| self.parent(*p))
    }

    /// True when every link from `id` up to the root goes through a parent's
    /// children, i.e. the node is part of what gets rendered.
    pub fn is_in_scope(&self, id: ElementId) -> bool {
        let mut cursor = id;
        while let Some(parent) = self.parent(cursor) {
            if !self.children(parent).contains(&cursor) {
                return false;
            }
            cursor = parent;
        }
        cursor == self.root
    }

    /// In-scope nodes below and including `id`, in document order.
    pub fn preorder(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// Every node owned below and including `id`, templates included.
    pub fn subtree(&self, id: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.owned(next).into_iter().rev());
        }
        out
    }

    pub fn find_child(&self, parent: ElementId, name: &str) -> Option<ElementId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.name(*c) == name)
    }

    /// Looks `name` up below `container`, also looking through array
    /// templates and choice alternatives when `templates` is set.
    fn lookup(&self, container: ElementId, name: &str, templates: bool) -> Option<ElementId> {
        if let Some(found) = self.find_child(container, name) {
            return Some(found);
        }
        if !templates {
            return None;
        }
        match &self.get(container).kind {
            ElementKind::Choice(state) => state
                .alternatives
                .iter()
                .copied()
                .find(|a| self.name(*a) == name),
            ElementKind::Array(state) => self.lookup(state.original, name, true),
            _ => None,
        }
    }

    fn descend(&self, start: ElementId, segments: &[&str], templates: bool) -> Option<ElementId> {
        segments
            .iter()
            .try_fold(start, |at, segment| self.lookup(at, segment, templates))
    }

    fn resolve_impl(&self, from: ElementId, path: &str, templates: bool) -> Option<ElementId> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut scope = Some(from);
        while let Some(at) = scope {
            if let Some(found) = self.descend(at, &segments, templates) {
                return Some(found);
            }
            if at == self.root && segments.first() == Some(&self.name(self.root)) {
                if let Some(found) = self.descend(at, &segments[1..], templates) {
                    return Some(found);
                }
            }
            scope = self.parent(at);
        }
        None
    }

    /// Resolves a dotted name the way relations and anchors are bound: from
    /// `from` outwards through its ancestors, looking into array templates
    /// and choice alternatives as well as children.
    pub fn resolve(&self, from: ElementId, path: &str) -> Option<ElementId> {
        self.resolve_impl(from, path, true)
    }

    /// Like [`resolve`](Self::resolve) but only through rendered children.
    pub fn resolve_in_scope(&self, from: ElementId, path: &str) -> Option<ElementId> {
        self.resolve_impl(from, path, false)
    }

    pub fn add_relation(&mut self, relation: Relation) -> RelationId {
        for endpoint in relation.endpoints() {
            assert!(
                self.contains(endpoint),
                "relation endpoint {endpoint} does not exist"
            );
        }
        self.relations.add(relation)
    }

    pub fn relation(&self, id: RelationId) -> &Relation {
        self.relations.get(id)
    }

    pub fn remove_relation(&mut self, id: RelationId) -> Option<Relation> {
        self.relations.remove(id)
    }

    /// The relation that drives `measurer` when rendering: the first one whose
    /// target (and anchor, if any) is in scope.
    pub fn effective_relation(&self, measurer: ElementId) -> Option<&Relation> {
        self.relations
            .measured_by(measurer)
            .iter()
            .map(|id| self.relations.get(*id))
            .find(|r| {
                self.is_in_scope(r.target) && r.relative_to.is_none_or(|a| self.is_in_scope(a))
            })
    }

    /// Relations of `kind` whose target is `target`, in registration order.
    pub fn relations_targeting(
        &self,
        target: ElementId,
        kind: RelationKind,
    ) -> impl Iterator<Item = &Relation> + '_ {
        self.relations
            .targeting(target)
            .iter()
            .map(|id| self.relations.get(*id))
            .filter(move |r| r.kind == kind)
    }

    /// Deep-copies `source` as a new detached node owned by `parent`.
    ///
    /// Relations touching the copied subtree are duplicated: endpoints inside
    /// the subtree point at their copies, endpoints outside stay as they are.
    pub fn clone_detached(
        &mut self,
        source: ElementId,
        parent: ElementId,
        new_name: Option<&str>,
    ) -> ElementId {
        let mut mapping = HashMap::new();
        let copy = self.clone_nodes(source, Some(parent), &mut mapping);

        let mut touched: Vec<RelationId> = mapping
            .keys()
            .flat_map(|old| self.relations.touching(*old))
            .collect();
        touched.sort();
        touched.dedup();
        for rel_id in touched {
            let mut relation = self.relations.get(rel_id).clone();
            let remap = |id: ElementId| mapping.get(&id).copied().unwrap_or(id);
            relation.measurer = remap(relation.measurer);
            relation.target = remap(relation.target);
            relation.relative_to = relation.relative_to.map(remap);
            self.relations.add(relation);
        }

        if let Some(name) = new_name {
            self.rename_unchecked(copy, name);
        }
        copy
    }

    fn clone_nodes(
        &mut self,
        source: ElementId,
        parent: Option<ElementId>,
        mapping: &mut HashMap<ElementId, ElementId>,
    ) -> ElementId {
        let mut element = self.get(source).clone();
        element.parent = parent;
        let old_children = std::mem::take(&mut element.children);
        let copy = self.alloc(element);
        mapping.insert(source, copy);

        let children: Vec<ElementId> = old_children
            .into_iter()
            .map(|c| self.clone_nodes(c, Some(copy), mapping))
            .collect();
        self.get_mut(copy).children = children;

        // Kind-owned templates are cloned after the children so their ids
        // can be rewritten in place.
        let mut kind = self.get(copy).kind.clone();
        match &mut kind {
            ElementKind::Array(state) => {
                state.original = self.clone_nodes(state.original, Some(copy), mapping);
                for template in state.instance_templates.values_mut() {
                    *template = self.clone_nodes(*template, Some(copy), mapping);
                }
            }
            ElementKind::Choice(state) => {
                for alternative in state.alternatives.iter_mut() {
                    *alternative = self.clone_nodes(*alternative, Some(copy), mapping);
                }
                if let Some((_, selected)) = state.selected.as_mut() {
                    *selected = mapping[&*selected];
                }
            }
            _ => {}
        }
        self.get_mut(copy).kind = kind;
        copy
    }

    /// Independent copy for a single run. Freed slots are copied too, so every
    /// id from this tree addresses the same element in the copy.
    pub fn fork(&self) -> DataTree {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Endian, Value};

    fn sample() -> (DataTree, ElementId, ElementId, ElementId) {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let len = tree.append_child(root, Element::number("len", 8, false, Endian::Big));
        let body = tree.append_child(root, Element::block("body"));
        let data = tree.append_child(body, Element::blob("data", None));
        tree.add_relation(Relation::new(RelationKind::Size, len, data));
        (tree, len, body, data)
    }

    #[test]
    fn full_names_follow_parents() {
        let (tree, len, _, data) = sample();
        assert_eq!(tree.full_name(len), "Model.len");
        assert_eq!(tree.full_name(data), "Model.body.data");
    }

    #[test]
    #[should_panic(expected = "duplicate full name")]
    fn duplicate_sibling_names_are_an_invariant_violation() {
        let (mut tree, ..) = sample();
        let root = tree.root();
        tree.append_child(root, Element::block("body"));
    }

    #[test]
    fn remove_purges_relations_in_the_same_step() {
        let (mut tree, len, body, data) = sample();
        assert!(tree.effective_relation(len).is_some());
        tree.remove(body);
        assert!(!tree.contains(data));
        assert!(tree.effective_relation(len).is_none());
        assert!(tree.relations().is_empty());
    }

    #[test]
    fn fork_keeps_ids_valid_after_removal() {
        let (mut tree, len, body, data) = sample();
        tree.remove(body);
        let mut copy = tree.fork();
        assert!(!copy.contains(data));
        assert_eq!(copy.full_name(len), "Model.len");

        copy.get_mut(len).default_value = Some(Value::Integer(7));
        assert_eq!(tree.get(len).default_value, None);
    }

    #[test]
    fn resolve_walks_outwards_through_ancestors() {
        let (tree, len, body, data) = sample();
        assert_eq!(tree.resolve(data, "len"), Some(len));
        assert_eq!(tree.resolve(len, "body.data"), Some(data));
        assert_eq!(tree.resolve(len, "Model.body"), Some(body));
        assert_eq!(tree.resolve(len, "nothing"), None);
    }

    #[test]
    fn clone_remaps_internal_relations_and_keeps_external_ones() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let outer = tree.append_child(root, Element::number("outer", 8, false, Endian::Big));
        let block = tree.append_child(root, Element::block("blk"));
        let inner = tree.append_child(block, Element::number("inner", 8, false, Endian::Big));
        let data = tree.append_child(block, Element::blob("data", None));
        tree.add_relation(Relation::new(RelationKind::Size, inner, data));
        tree.add_relation(Relation::new(RelationKind::Size, outer, block));

        let copy = tree.clone_detached(block, root, Some("blk2"));
        tree.attach(root, copy, None);

        let inner2 = tree.find_child(copy, "inner").unwrap();
        let data2 = tree.find_child(copy, "data").unwrap();
        assert_eq!(tree.effective_relation(inner2).unwrap().target, data2);
        assert_eq!(tree.relations().measured_by(outer).len(), 2);
        assert_eq!(tree.relations().len(), 4);

        tree.remove(copy);
        assert_eq!(tree.relations().len(), 2, "copies purged with their nodes");
    }

    #[test]
    fn clone_copies_values_without_aliasing() {
        let (mut tree, len, ..) = sample();
        let root = tree.root();
        tree.get_mut(len).default_value = Some(Value::Integer(1));
        let copy = tree.clone_detached(len, root, Some("len2"));
        tree.get_mut(copy).default_value = Some(Value::Integer(2));
        assert_eq!(tree.get(len).default_value, Some(Value::Integer(1)));
        assert!(!tree.is_in_scope(copy), "detached until attached");
        tree.attach(root, copy, Some(0));
        assert!(tree.is_in_scope(copy));
        assert_eq!(tree.children(root)[0], copy);
    }
}

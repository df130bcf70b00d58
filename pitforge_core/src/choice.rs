//! Variant containers.
//!
//! A choice keeps every alternative as a detached template. Selecting one
//! clones it into the choice's only child slot, so everything the selection
//! owns (including relation edges) is dropped when the selection changes.

use crate::element::{ElementId, ElementKind};
use crate::tree::DataTree;
use log::trace;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChoiceState {
    pub alternatives: Vec<ElementId>,
    /// Index into `alternatives` and the id of the live clone.
    pub selected: Option<(usize, ElementId)>,
}

impl DataTree {
    pub fn choice_state(&self, choice: ElementId) -> &ChoiceState {
        match &self.get(choice).kind {
            ElementKind::Choice(state) => state,
            other => panic!("{} is a {}, not a choice", self.full_name(choice), other.name()),
        }
    }

    fn choice_state_mut(&mut self, choice: ElementId) -> &mut ChoiceState {
        let path = self.full_name(choice);
        match &mut self.get_mut(choice).kind {
            ElementKind::Choice(state) => state,
            other => panic!("{path} is a {}, not a choice", other.name()),
        }
    }

    pub fn alternatives(&self, choice: ElementId) -> &[ElementId] {
        &self.choice_state(choice).alternatives
    }

    /// The live clone of the selected alternative.
    pub fn selected(&self, choice: ElementId) -> Option<ElementId> {
        self.choice_state(choice).selected.map(|(_, id)| id)
    }

    pub fn selected_index(&self, choice: ElementId) -> Option<usize> {
        self.choice_state(choice).selected.map(|(index, _)| index)
    }

    /// Exposes alternative `index` as the choice's content, dropping any
    /// previous selection first.
    pub fn select(&mut self, choice: ElementId, index: usize) -> ElementId {
        let alternatives = self.alternatives(choice);
        assert!(
            index < alternatives.len(),
            "{} has no alternative {index}",
            self.full_name(choice)
        );
        let alternative = alternatives[index];
        self.clear_selection(choice);
        let name = self.name(alternative).to_string();
        let clone = self.clone_detached(alternative, choice, Some(&name));
        self.attach(choice, clone, None);
        self.choice_state_mut(choice).selected = Some((index, clone));
        trace!("selected {} in {}", name, self.full_name(choice));
        clone
    }

    pub fn select_by_name(&mut self, choice: ElementId, name: &str) -> Option<ElementId> {
        let index = self
            .alternatives(choice)
            .iter()
            .position(|a| self.name(*a) == name)?;
        Some(self.select(choice, index))
    }

    /// Removes the selected clone, along with every relation edge it owned.
    pub fn clear_selection(&mut self, choice: ElementId) {
        if let Some((_, selected)) = self.choice_state(choice).selected {
            self.remove(selected);
        }
        self.choice_state_mut(choice).selected = None;
    }

    /// Selects the first alternative of every unselected choice in scope
    /// below `id`, descending into what gets selected.
    pub fn select_defaults(&mut self, id: ElementId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let (unselected_choice, array) = match self.kind(next) {
                ElementKind::Choice(state) => {
                    (state.selected.is_none() && !state.alternatives.is_empty(), false)
                }
                ElementKind::Array(_) => (false, true),
                _ => (false, false),
            };
            if unselected_choice {
                self.select(next, 0);
            } else if array {
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

    /// A size field followed by a choice whose alternatives all hold a blob
    /// measured by that field.
    fn sized_choice() -> (DataTree, ElementId, ElementId) {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let len = tree.append_child(root, Element::number("len", 8, false, Endian::Big));
        let choice = tree.add_detached(root, Element::new("c", ElementKind::Block));
        let mut alternatives = Vec::new();
        for name in ["a", "b"] {
            let alt = tree.add_detached(choice, Element::block(name));
            let data = tree.append_child(alt, Element::blob("data", None));
            tree.add_relation(Relation::new(RelationKind::Size, len, data));
            alternatives.push(alt);
        }
        tree.get_mut(choice).kind = ElementKind::Choice(ChoiceState {
            alternatives,
            selected: None,
        });
        tree.attach(root, choice, None);
        (tree, len, choice)
    }

    #[test]
    fn nothing_is_selected_until_asked() {
        let (tree, len, choice) = sized_choice();
        assert_eq!(tree.selected(choice), None);
        assert!(tree.children(choice).is_empty());
        assert!(tree.effective_relation(len).is_none(), "templates are out of scope");
    }

    #[test]
    fn selection_exposes_one_clone_with_live_relations() {
        let (mut tree, len, choice) = sized_choice();
        let selected = tree.select(choice, 1);
        assert_eq!(tree.children(choice), &[selected]);
        assert_eq!(tree.selected_index(choice), Some(1));
        let data = tree.find_child(selected, "data").unwrap();
        assert_eq!(tree.effective_relation(len).unwrap().target, data);
        assert_eq!(tree.full_name(data), "Model.c.b.data");
    }

    #[test]
    fn reselecting_drops_the_previous_clone_and_its_edges() {
        let (mut tree, len, choice) = sized_choice();
        let first = tree.select(choice, 0);
        let before = tree.relations().len();
        let second = tree.select(choice, 1);
        assert!(!tree.contains(first));
        assert_eq!(tree.relations().len(), before);
        assert_eq!(tree.children(choice), &[second]);

        tree.remove(second);
        assert_eq!(tree.selected(choice), None);
        assert!(tree.effective_relation(len).is_none());
        assert_eq!(tree.relations().len(), 2, "only template edges remain");
    }

    #[test]
    fn select_defaults_picks_first_alternative() {
        let (mut tree, _, choice) = sized_choice();
        let root = tree.root();
        tree.select_defaults(root);
        assert_eq!(tree.selected_index(choice), Some(0));
        assert_eq!(tree.select_by_name(choice, "b").map(|id| tree.name(id).to_string()), Some("b".into()));
        assert!(tree.select_by_name(choice, "zzz").is_none());
    }
}

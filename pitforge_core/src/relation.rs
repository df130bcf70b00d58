//! Size, count and offset relations between elements.
//!
//! The index keeps every edge reachable from both of its endpoints (and from
//! its `relativeTo` anchor) so that removing a node can purge every edge that
//! touches it in the same step.

use crate::element::ElementId;
use crate::value::LengthType;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Size,
    Count,
    Offset,
}

impl RelationKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "size" => Some(RelationKind::Size),
            "count" => Some(RelationKind::Count),
            "offset" => Some(RelationKind::Offset),
            _ => None,
        }
    }

    pub fn variable(self) -> &'static str {
        match self {
            RelationKind::Size => "size",
            RelationKind::Count => "count",
            RelationKind::Offset => "offset",
        }
    }
}

/// A directed edge: `measurer` holds a quantity computed from `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub kind: RelationKind,
    pub measurer: ElementId,
    pub target: ElementId,
    /// Unit for size and offset relations.
    pub length_type: LengthType,
    /// Maps a cracked measurer value back to the quantity.
    pub expression_get: Option<String>,
    /// Maps the quantity to the value rendered into the measurer.
    pub expression_set: Option<String>,
    /// Offset is measured from the measurer instead of the model start.
    pub relative: bool,
    /// Offset is measured from this element instead of the model start.
    pub relative_to: Option<ElementId>,
}

impl Relation {
    pub fn new(kind: RelationKind, measurer: ElementId, target: ElementId) -> Self {
        Self {
            kind,
            measurer,
            target,
            length_type: LengthType::Bytes,
            expression_get: None,
            expression_set: None,
            relative: false,
            relative_to: None,
        }
    }

    /// Elements this edge refers to, in any role.
    pub fn endpoints(&self) -> impl Iterator<Item = ElementId> + '_ {
        [Some(self.measurer), Some(self.target), self.relative_to]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(usize);

#[derive(Debug, Clone, Default)]
pub struct RelationIndex {
    slots: Vec<Option<Relation>>,
    by_target: HashMap<ElementId, Vec<RelationId>>,
    by_measurer: HashMap<ElementId, Vec<RelationId>>,
    by_anchor: HashMap<ElementId, Vec<RelationId>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, relation: Relation) -> RelationId {
        let id = RelationId(self.slots.len());
        self.by_target.entry(relation.target).or_default().push(id);
        self.by_measurer.entry(relation.measurer).or_default().push(id);
        if let Some(anchor) = relation.relative_to {
            self.by_anchor.entry(anchor).or_default().push(id);
        }
        self.slots.push(Some(relation));
        id
    }

    pub fn get(&self, id: RelationId) -> &Relation {
        match self.slots.get(id.0).and_then(Option::as_ref) {
            Some(relation) => relation,
            None => panic!("relation {id:?} was purged but is still referenced"),
        }
    }

    /// Edges whose target is `id`, in registration order.
    pub fn targeting(&self, id: ElementId) -> &[RelationId] {
        self.by_target.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges whose measurer is `id`, in registration order.
    pub fn measured_by(&self, id: ElementId) -> &[RelationId] {
        self.by_measurer.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every edge touching `id` in any role.
    pub fn touching(&self, id: ElementId) -> Vec<RelationId> {
        let mut ids: Vec<RelationId> = self
            .targeting(id)
            .iter()
            .chain(self.measured_by(id))
            .chain(self.by_anchor.get(&id).map(Vec::as_slice).unwrap_or(&[]))
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_measurer(&self, id: ElementId) -> bool {
        !self.measured_by(id).is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes one edge from every index it appears in.
    pub fn remove(&mut self, id: RelationId) -> Option<Relation> {
        let relation = self.slots.get_mut(id.0)?.take()?;
        for (map, key) in [
            (&mut self.by_target, Some(relation.target)),
            (&mut self.by_measurer, Some(relation.measurer)),
            (&mut self.by_anchor, relation.relative_to),
        ] {
            let Some(key) = key else { continue };
            if let Some(list) = map.get_mut(&key) {
                list.retain(|r| *r != id);
                if list.is_empty() {
                    map.remove(&key);
                }
            }
        }
        Some(relation)
    }

    /// Removes every edge touching `element`, in any role.
    pub fn purge_element(&mut self, element: ElementId) -> usize {
        let ids = self.touching(element);
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelationId, &Relation)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (RelationId(i), r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> ElementId {
        ElementId(n)
    }

    #[test]
    fn edges_are_reachable_from_both_ends() {
        let mut index = RelationIndex::new();
        let rel = index.add(Relation::new(RelationKind::Size, id(1), id(2)));
        assert_eq!(index.targeting(id(2)), &[rel]);
        assert_eq!(index.measured_by(id(1)), &[rel]);
        assert!(index.is_measurer(id(1)));
        assert!(!index.is_measurer(id(2)));
    }

    #[test]
    fn purging_a_target_removes_shared_edges_only_for_it() {
        let mut index = RelationIndex::new();
        index.add(Relation::new(RelationKind::Size, id(1), id(2)));
        index.add(Relation::new(RelationKind::Size, id(1), id(3)));
        assert_eq!(index.purge_element(id(2)), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.measured_by(id(1)).len(), 1);
        assert!(index.targeting(id(2)).is_empty());
    }

    #[test]
    fn purging_an_anchor_removes_the_edge() {
        let mut index = RelationIndex::new();
        let mut relation = Relation::new(RelationKind::Offset, id(1), id(2));
        relation.relative_to = Some(id(7));
        index.add(relation);
        assert_eq!(index.purge_element(id(7)), 1);
        assert!(index.is_empty());
        assert!(index.measured_by(id(1)).is_empty());
    }
}

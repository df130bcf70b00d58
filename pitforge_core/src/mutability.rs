//! Mutability flags and weights.
//!
//! Rules are applied in order to the element a path names and everything it
//! owns, templates included, so later rules win and instances created after
//! the rules ran inherit them.

use crate::element::ElementId;
use crate::error::DocumentError;
use crate::tree::DataTree;
use log::debug;
use serde::{Deserialize, Serialize};

/// Relative chance of an element being picked for mutation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Weight {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

impl Weight {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "lowest" => Some(Weight::Lowest),
            "below-normal" => Some(Weight::BelowNormal),
            "normal" => Some(Weight::Normal),
            "above-normal" => Some(Weight::AboveNormal),
            "highest" => Some(Weight::Highest),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MutabilityAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutabilityRule {
    pub action: MutabilityAction,
    /// Dotted path from the model root. The root's own name addresses the root.
    pub path: String,
    pub weight: Option<Weight>,
}

impl MutabilityRule {
    pub fn include(path: impl Into<String>) -> Self {
        Self {
            action: MutabilityAction::Include,
            path: path.into(),
            weight: None,
        }
    }

    pub fn exclude(path: impl Into<String>) -> Self {
        Self {
            action: MutabilityAction::Exclude,
            path: path.into(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Applies `rules` in order and returns how many elements were touched.
pub fn apply_rules(tree: &mut DataTree, rules: &[MutabilityRule]) -> Result<usize, DocumentError> {
    let mut touched = 0;
    for rule in rules {
        let target = rule_target(tree, &rule.path)?;
        let mutable = rule.action == MutabilityAction::Include;
        let affected = tree.subtree(target);
        for id in &affected {
            let element = tree.get_mut(*id);
            element.mutable = mutable;
            if let Some(weight) = rule.weight {
                element.weight = weight;
            }
        }
        debug!(
            "{:?} {} ({} element(s))",
            rule.action,
            tree.full_name(target),
            affected.len()
        );
        touched += affected.len();
    }
    Ok(touched)
}

fn rule_target(tree: &DataTree, path: &str) -> Result<ElementId, DocumentError> {
    let root = tree.root();
    let root_name = tree.name(root);
    let relative = match path.strip_prefix(root_name) {
        Some("") => return Ok(root),
        Some(rest) => rest.strip_prefix('.').unwrap_or(path),
        None => path,
    };
    tree.resolve(root, relative)
        .ok_or_else(|| DocumentError::NoSuchChild {
            path: root_name.to_string(),
            child: path.to_string(),
        })
}

impl DataTree {
    /// An element is mutable when it and every ancestor allow it.
    pub fn is_mutable(&self, id: ElementId) -> bool {
        self.get(id).mutable && self.ancestors(id).all(|a| self.get(a).mutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::value::Endian;

    fn tree() -> (DataTree, ElementId, ElementId) {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let header = tree.append_child(root, Element::block("header"));
        let len = tree.append_child(header, Element::number("len", 16, false, Endian::Big));
        tree.append_child(root, Element::blob("body", None));
        (tree, header, len)
    }

    #[test]
    fn later_rules_win() -> Result<(), DocumentError> {
        let (mut tree, header, len) = tree();
        let touched = apply_rules(
            &mut tree,
            &[
                MutabilityRule::exclude("Model"),
                MutabilityRule::include("header.len").with_weight(Weight::Highest),
            ],
        )?;
        assert_eq!(touched, 5);
        assert!(!tree.get(header).mutable);
        assert!(tree.get(len).mutable);
        assert_eq!(tree.get(len).weight, Weight::Highest);
        assert!(!tree.is_mutable(len), "an excluded ancestor still wins");
        Ok(())
    }

    #[test]
    fn full_name_paths_and_missing_targets() {
        let (mut tree, header, _) = tree();
        apply_rules(&mut tree, &[MutabilityRule::exclude("Model.header")]).unwrap();
        assert!(!tree.get(header).mutable);

        let err = apply_rules(&mut tree, &[MutabilityRule::include("trailer")]).unwrap_err();
        assert!(matches!(err, DocumentError::NoSuchChild { .. }), "got {err}");
    }

    #[test]
    fn weight_names() {
        assert_eq!(Weight::parse("below-normal"), Some(Weight::BelowNormal));
        assert_eq!(Weight::parse("loud"), None);
        assert!(Weight::Lowest < Weight::Highest);
        assert_eq!(Weight::default(), Weight::Normal);
    }
}

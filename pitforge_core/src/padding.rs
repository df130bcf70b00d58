//! Alignment filler.

use crate::element::{ElementId, ElementKind, PaddingSpec};
use crate::error::DocumentError;
use crate::tree::DataTree;

/// Number of filler bits for a padding whose measurement base lies
/// `measured` bits before it.
///
/// `min_size` is a floor on `measured + filler`; the result is then rounded up
/// so that `measured + filler` lands on an `alignment` boundary.
pub fn filler_bits(spec: &PaddingSpec, measured: u64) -> u64 {
    let mut filler = spec.min_size.saturating_sub(measured);
    if spec.alignment > 0 {
        let rem = (measured + filler) % spec.alignment;
        if rem != 0 {
            filler += spec.alignment - rem;
        }
    }
    filler
}

/// The element a padding measures from when rendering or cracking: its
/// in-scope `alignedTo` anchor when set, otherwise its enclosing container.
pub fn measurement_base(tree: &DataTree, padding: ElementId) -> Option<ElementId> {
    let ElementKind::Padding(spec) = tree.kind(padding) else {
        return None;
    };
    match &spec.aligned_to {
        Some(anchor) => tree.resolve_in_scope(padding, anchor),
        None => tree.parent(padding),
    }
}

/// Build-time check that an `alignedTo` anchor resolves.
pub fn validate(tree: &DataTree, padding: ElementId) -> Result<(), DocumentError> {
    let ElementKind::Padding(spec) = tree.kind(padding) else {
        return Ok(());
    };
    if let Some(anchor) = &spec.aligned_to {
        if tree.resolve(padding, anchor).is_none() {
            return Err(DocumentError::UnresolvedAnchor {
                path: tree.full_name(padding),
                anchor: anchor.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::value::Endian;

    fn spec(alignment: u64, min_size: u64) -> PaddingSpec {
        PaddingSpec {
            alignment,
            min_size,
            aligned_to: None,
        }
    }

    #[test]
    fn aligns_to_the_next_boundary() {
        assert_eq!(filler_bits(&spec(128, 0), 80), 48);
        assert_eq!(filler_bits(&spec(16, 0), 8), 8);
        assert_eq!(filler_bits(&spec(8, 0), 16), 0);
        assert_eq!(filler_bits(&spec(32, 0), 0), 0);
    }

    #[test]
    fn min_size_is_a_floor_before_alignment() {
        assert_eq!(filler_bits(&spec(8, 64), 16), 48);
        assert_eq!(filler_bits(&spec(32, 40), 8), 56, "40 rounds up to 64");
        assert_eq!(filler_bits(&spec(0, 24), 8), 16);
        assert_eq!(filler_bits(&spec(8, 8), 32), 0, "already past the floor");
    }

    #[test]
    fn anchors_must_resolve() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let head = tree.append_child(root, Element::number("head", 8, false, Endian::Big));
        let good = tree.append_child(
            root,
            Element::padding(
                "pad",
                PaddingSpec {
                    aligned_to: Some("head".into()),
                    ..PaddingSpec::default()
                },
            ),
        );
        assert!(validate(&tree, good).is_ok());
        assert_eq!(measurement_base(&tree, good), Some(head));

        let bad = tree.append_child(
            root,
            Element::padding(
                "pad2",
                PaddingSpec {
                    aligned_to: Some("missing".into()),
                    ..PaddingSpec::default()
                },
            ),
        );
        assert!(matches!(
            validate(&tree, bad),
            Err(DocumentError::UnresolvedAnchor { .. })
        ));
    }
}

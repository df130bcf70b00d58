//! Dotted paths and reference overrides.
//!
//! A definition that references a template gets a deep copy of it, then its
//! own children are merged in. Each child name is a path walked one segment
//! at a time from the copy's root. An existing child with the last segment's
//! name is replaced in place, otherwise the child is appended. Indexed
//! segments (`Items[2]`) address a per-index instance template of an array
//! and grow its minimum occurrence count to include that index.

use crate::def::ElementDef;
use crate::error::DocumentError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    pub name: String,
    pub index: Option<i64>,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{index}]", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Splits `a.b[2].c` into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, String> {
    path.split('.')
        .map(|part| {
            let (name, index) = match part.strip_suffix(']') {
                Some(head) => {
                    let open = head
                        .rfind('[')
                        .ok_or_else(|| format!("unbalanced ']' in '{part}'"))?;
                    let index = head[open + 1..]
                        .parse::<i64>()
                        .map_err(|_| format!("invalid index in '{part}'"))?;
                    (&head[..open], Some(index))
                }
                None => (part, None),
            };
            if name.is_empty() || name.contains('[') {
                return Err(format!("invalid path segment '{part}'"));
            }
            Ok(PathSegment {
                name: name.to_string(),
                index,
            })
        })
        .collect()
}

/// Returns a copy of `template` with every override merged in, in order.
pub fn apply_overrides(
    template: &ElementDef,
    overrides: &[ElementDef],
) -> Result<ElementDef, DocumentError> {
    let mut merged = template.clone();
    for replacement in overrides {
        apply_override(&mut merged, replacement)?;
    }
    Ok(merged)
}

fn apply_override(root: &mut ElementDef, replacement: &ElementDef) -> Result<(), DocumentError> {
    let segments = parse_path(&replacement.name).map_err(|reason| DocumentError::InvalidAttribute {
        path: root.name.clone(),
        attribute: "name".into(),
        value: replacement.name.clone(),
        reason,
    })?;
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };

    let mut path = root.name.clone();
    let mut cursor = root;
    for segment in parents {
        cursor = step(cursor, segment, &mut path)?;
        if !cursor.kind.is_container() {
            return Err(DocumentError::NotContainer {
                path,
                segment: segment.to_string(),
            });
        }
    }

    let mut replacement = replacement.clone();
    replacement.name = last.name.clone();
    match last.index {
        None => match cursor.child_mut(&last.name) {
            Some(existing) => *existing = replacement,
            None => cursor.children.push(replacement),
        },
        Some(_) => {
            let instance = step(cursor, last, &mut path)?;
            replacement.name = instance.name.clone();
            replacement.occurs = None;
            *instance = replacement;
        }
    }
    Ok(())
}

/// Moves from `cursor` to its child named by `segment`, or to that array
/// child's instance template when the segment is indexed.
fn step<'d>(
    cursor: &'d mut ElementDef,
    segment: &PathSegment,
    path: &mut String,
) -> Result<&'d mut ElementDef, DocumentError> {
    let child = cursor
        .child_mut(&segment.name)
        .ok_or_else(|| DocumentError::NoSuchChild {
            path: path.clone(),
            child: segment.name.clone(),
        })?;
    path.push('.');
    path.push_str(&segment.to_string());
    match segment.index {
        None => Ok(child),
        Some(index) => instance_template(child, index, segment, path),
    }
}

fn instance_template<'d>(
    array: &'d mut ElementDef,
    index: i64,
    segment: &PathSegment,
    path: &str,
) -> Result<&'d mut ElementDef, DocumentError> {
    let template = array.template();
    let invalid = |reason: String| DocumentError::InvalidIndex {
        path: path.to_string(),
        segment: segment.name.clone(),
        index,
        reason,
    };
    let occurs = array.occurs.as_mut().ok_or_else(|| DocumentError::NotAnArray {
        path: path.to_string(),
        segment: segment.name.clone(),
    })?;
    let index = u32::try_from(index).map_err(|_| invalid("index must not be negative".into()))?;
    occurs.include_index(index).map_err(invalid)?;
    Ok(occurs.instances.entry(index).or_insert(template))
}

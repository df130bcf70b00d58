//! Bit-field containers.
//!
//! A `Flags` element of `S` bits holds `Flag` children that each own a
//! `{position, size}` range. Big endian counts positions from the most
//! significant bit, little endian from the least significant bit; the packed
//! integer is then written as an `S`-bit number in the same byte order.

use crate::bits::{BitBuffer, BitReader};
use crate::element::{ElementId, ElementKind, FlagSpec, FlagsSpec};
use crate::error::DocumentError;
use crate::tree::DataTree;
use crate::value::{Endian, decode_raw, encode_raw};

fn shift_for(container: &FlagsSpec, flag: &FlagSpec) -> u32 {
    match container.endian {
        Endian::Big => container.size - flag.position - flag.size,
        Endian::Little => flag.position,
    }
}

fn mask(size: u32) -> u64 {
    if size >= 64 { u64::MAX } else { (1u64 << size) - 1 }
}

/// Packs `(flag, value)` pairs into the container's integer and encodes it.
///
/// Values wider than their flag are truncated to the flag's bits.
pub fn pack(container: &FlagsSpec, values: &[(FlagSpec, u64)]) -> BitBuffer {
    let packed = values.iter().fold(0u64, |acc, (flag, value)| {
        acc | ((value & mask(flag.size)) << shift_for(container, flag))
    });
    encode_raw(packed, container.size, container.endian)
}

/// Reads the container's integer from `reader`.
pub fn read_packed(container: &FlagsSpec, reader: &mut BitReader<'_>) -> Option<u64> {
    decode_raw(reader, container.size, container.endian)
}

/// Extracts one flag's value from a packed integer.
pub fn unpack(container: &FlagsSpec, flag: &FlagSpec, packed: u64) -> u64 {
    (packed >> shift_for(container, flag)) & mask(flag.size)
}

/// Checks a Flags element's children for range and overlap errors.
pub fn validate(tree: &DataTree, flags: ElementId) -> Result<(), DocumentError> {
    let ElementKind::Flags(container) = tree.kind(flags) else {
        return Ok(());
    };
    let path = tree.full_name(flags);
    let mut seen: Vec<(String, u32, u32)> = Vec::new();
    for child in tree.children(flags) {
        let ElementKind::Flag(flag) = tree.kind(*child) else {
            return Err(DocumentError::UnknownElement {
                path: tree.full_name(*child),
                tag: tree.kind(*child).name().to_string(),
            });
        };
        let name = tree.name(*child).to_string();
        if flag.size == 0 || flag.position + flag.size > container.size {
            return Err(DocumentError::FlagOutOfRange {
                path,
                flag: name,
                position: flag.position,
                size: flag.size,
                container: container.size,
            });
        }
        let start = flag.position;
        let end = flag.position + flag.size;
        if let Some((other, ..)) = seen.iter().find(|(_, s, e)| start < *e && *s < end) {
            return Err(DocumentError::FlagOverlap {
                path,
                first: other.clone(),
                second: name,
            });
        }
        seen.push((name, start, end));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;

    fn nibbles() -> Vec<(FlagSpec, u64)> {
        [0xa, 0xb, 0xc, 0xd]
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (
                    FlagSpec {
                        position: i as u32 * 4,
                        size: 4,
                    },
                    *v,
                )
            })
            .collect()
    }

    #[test]
    fn big_endian_counts_from_the_top() {
        let spec = FlagsSpec {
            size: 16,
            endian: Endian::Big,
        };
        assert_eq!(pack(&spec, &nibbles()).as_bytes(), &[0xab, 0xcd]);
    }

    #[test]
    fn little_endian_counts_from_the_bottom() {
        let spec = FlagsSpec {
            size: 16,
            endian: Endian::Little,
        };
        assert_eq!(pack(&spec, &nibbles()).as_bytes(), &[0xba, 0xdc]);
    }

    #[test]
    fn unpack_inverts_pack_for_both_byte_orders() {
        for endian in [Endian::Big, Endian::Little] {
            let spec = FlagsSpec { size: 16, endian };
            let bytes = pack(&spec, &nibbles()).into_bytes();
            let mut reader = BitReader::new(&bytes);
            let packed = read_packed(&spec, &mut reader).unwrap();
            let values: Vec<u64> = nibbles()
                .iter()
                .map(|(flag, _)| unpack(&spec, flag, packed))
                .collect();
            assert_eq!(values, [0xa, 0xb, 0xc, 0xd], "endian {endian:?}");
        }
    }

    #[test]
    fn unspecified_bits_stay_zero() {
        let spec = FlagsSpec {
            size: 8,
            endian: Endian::Big,
        };
        let one = [(FlagSpec { position: 1, size: 1 }, 1)];
        assert_eq!(pack(&spec, &one).as_bytes(), &[0b0100_0000]);
    }

    #[test]
    fn overlap_and_overflow_are_rejected() {
        let mut tree = DataTree::new("Model");
        let root = tree.root();
        let flags = tree.append_child(root, Element::flags("f", 8, Endian::Big));
        tree.append_child(flags, Element::flag("a", 0, 4));
        tree.append_child(flags, Element::flag("b", 4, 4));
        assert!(validate(&tree, flags).is_ok());

        tree.append_child(flags, Element::flag("c", 3, 2));
        match validate(&tree, flags) {
            Err(DocumentError::FlagOverlap { first, second, .. }) => {
                assert_eq!((first.as_str(), second.as_str()), ("a", "c"));
            }
            other => panic!("expected overlap, got {other:?}"),
        }

        let wide = tree.append_child(root, Element::flags("g", 8, Endian::Big));
        tree.append_child(wide, Element::flag("x", 6, 4));
        assert!(matches!(
            validate(&tree, wide),
            Err(DocumentError::FlagOutOfRange { .. })
        ));
    }
}

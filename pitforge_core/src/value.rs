//! Typed element values and the bit-level codecs shared by the renderer and
//! the cracker.

use crate::bits::{BitBuffer, BitReader};
use crate::error::ValueError;
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A scalar carried by a leaf element or produced by an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i128),
    Float(f64),
    Bool(bool),
    Text(String),
    Bits(BitBuffer),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Text(_) => "string",
            Value::Bits(_) => "bytes",
        }
    }

    pub fn as_integer(&self) -> Result<i128, ValueError> {
        match self {
            Value::Integer(v) => Ok(*v),
            Value::Bool(b) => Ok(*b as i128),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i128),
            Value::Text(text) => parse_integer(text),
            Value::Bits(bits) if bits.len_bits() <= 64 => {
                Ok(bits.read_u64(0, bits.len_bits() as u32) as i128)
            }
            other => Err(ValueError::Mismatch {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Integer(v) => Ok(*v as f64),
            Value::Text(text) => text.trim().parse().map_err(|_| ValueError::Parse {
                text: text.clone(),
                expected: "float",
            }),
            other => Err(ValueError::Mismatch {
                expected: "float",
                found: other.type_name(),
            }),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Integer(v) => *v != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::Text(text) => !text.is_empty(),
            Value::Bits(bits) => !bits.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bits(v) => write!(f, "{}", v.to_hex()),
        }
    }
}

/// How the text of a `value` attribute is interpreted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    #[default]
    String,
    Hex,
    Literal,
    Ipv4,
    Ipv6,
}

impl ValueType {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "string" => Some(ValueType::String),
            "hex" => Some(ValueType::Hex),
            "literal" => Some(ValueType::Literal),
            "ipv4" => Some(ValueType::Ipv4),
            "ipv6" => Some(ValueType::Ipv6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    Big,
    #[default]
    Little,
}

impl Endian {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "big" | "network" => Some(Endian::Big),
            "little" => Some(Endian::Little),
            _ => None,
        }
    }
}

/// Unit of a `length` attribute or of a size relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthType {
    #[default]
    Bytes,
    Bits,
    Chars,
}

impl LengthType {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "bytes" => Some(LengthType::Bytes),
            "bits" => Some(LengthType::Bits),
            "chars" => Some(LengthType::Chars),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    #[default]
    Ascii,
    Utf8,
    Utf16,
    Utf16Be,
    Utf32,
}

impl StringEncoding {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ascii" => Some(StringEncoding::Ascii),
            "utf8" => Some(StringEncoding::Utf8),
            "utf16" => Some(StringEncoding::Utf16),
            "utf16be" => Some(StringEncoding::Utf16Be),
            "utf32" => Some(StringEncoding::Utf32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StringEncoding::Ascii => "ascii",
            StringEncoding::Utf8 => "utf8",
            StringEncoding::Utf16 => "utf16",
            StringEncoding::Utf16Be => "utf16be",
            StringEncoding::Utf32 => "utf32",
        }
    }

    /// Width of one code unit in bytes.
    pub fn unit_bytes(self) -> usize {
        match self {
            StringEncoding::Ascii | StringEncoding::Utf8 => 1,
            StringEncoding::Utf16 | StringEncoding::Utf16Be => 2,
            StringEncoding::Utf32 => 4,
        }
    }

    /// Bits per character when every character has the same width.
    pub fn fixed_char_bits(self) -> Option<u64> {
        match self {
            StringEncoding::Ascii => Some(8),
            StringEncoding::Utf8 | StringEncoding::Utf16 | StringEncoding::Utf16Be => None,
            StringEncoding::Utf32 => Some(32),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, ValueError> {
        match self {
            StringEncoding::Ascii => {
                if !text.is_ascii() {
                    return Err(ValueError::Encoding { encoding: "ascii" });
                }
                Ok(text.as_bytes().to_vec())
            }
            StringEncoding::Utf8 => Ok(text.as_bytes().to_vec()),
            StringEncoding::Utf16 => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            StringEncoding::Utf16Be => {
                Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect())
            }
            StringEncoding::Utf32 => Ok(text.chars().flat_map(|c| (c as u32).to_le_bytes()).collect()),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<String, ValueError> {
        let invalid = || ValueError::Encoding {
            encoding: self.name(),
        };
        match self {
            StringEncoding::Ascii => {
                if !bytes.is_ascii() {
                    return Err(invalid());
                }
                Ok(bytes.iter().map(|b| *b as char).collect())
            }
            StringEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| invalid()),
            StringEncoding::Utf16 | StringEncoding::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(invalid());
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if self == StringEncoding::Utf16 {
                            u16::from_le_bytes(pair)
                        } else {
                            u16::from_be_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|_| invalid())
            }
            StringEncoding::Utf32 => {
                if bytes.len() % 4 != 0 {
                    return Err(invalid());
                }
                bytes
                    .chunks_exact(4)
                    .map(|quad| {
                        char::from_u32(u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                            .ok_or_else(invalid)
                    })
                    .collect()
            }
        }
    }
}

/// Parses a decimal or `0x`-prefixed integer, with an optional sign.
pub fn parse_integer(text: &str) -> Result<i128, ValueError> {
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16),
        None => digits.parse::<i128>(),
    };
    parsed
        .map(|v| if negative { -v } else { v })
        .map_err(|_| ValueError::Parse {
            text: text.to_string(),
            expected: "integer",
        })
}

/// Parses whitespace-separated or contiguous hex digit pairs, with optional `0x` prefixes.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, ValueError> {
    let err = || ValueError::Parse {
        text: text.to_string(),
        expected: "hex",
    };
    let mut digits = String::new();
    for token in text.split_whitespace() {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        digits.push_str(token);
    }
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(err());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| err()))
        .collect()
}

/// Converts value text into raw bytes according to a non-expression value type.
///
/// Returns `None` for `ValueType::String`, whose interpretation depends on
/// the element kind.
pub fn raw_bytes(text: &str, value_type: ValueType) -> Result<Option<Vec<u8>>, ValueError> {
    match value_type {
        ValueType::String | ValueType::Literal => Ok(None),
        ValueType::Hex => parse_hex(text).map(Some),
        ValueType::Ipv4 => text
            .trim()
            .parse::<Ipv4Addr>()
            .map(|ip| Some(ip.octets().to_vec()))
            .map_err(|_| ValueError::Parse {
                text: text.to_string(),
                expected: "ipv4 address",
            }),
        ValueType::Ipv6 => text
            .trim()
            .parse::<Ipv6Addr>()
            .map(|ip| Some(ip.octets().to_vec()))
            .map_err(|_| ValueError::Parse {
                text: text.to_string(),
                expected: "ipv6 address",
            }),
    }
}

/// Big-endian interpretation of up to 16 bytes.
pub fn bytes_to_integer(bytes: &[u8]) -> Result<i128, ValueError> {
    if bytes.len() > 16 {
        return Err(ValueError::Mismatch {
            expected: "at most 16 bytes",
            found: "longer byte string",
        });
    }
    Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128) as i128)
}

fn bounds(size: u32, signed: bool) -> (i128, i128) {
    if signed {
        (-(1i128 << (size - 1)), (1i128 << (size - 1)) - 1)
    } else {
        (0, (1i128 << size) - 1)
    }
}

/// Checks that `value` fits a number of `size` bits.
pub fn check_range(value: i128, size: u32, signed: bool) -> Result<(), ValueError> {
    let (min, max) = bounds(size, signed);
    if value < min || value > max {
        return Err(ValueError::OutOfRange {
            value,
            size,
            signedness: if signed { "signed" } else { "unsigned" },
        });
    }
    Ok(())
}

/// Writes the low `size` bits of `raw` with the given byte order.
///
/// Little endian emits whole bytes least-significant first, then the
/// remaining high bits as a final partial byte.
pub fn encode_raw(raw: u64, size: u32, endian: Endian) -> BitBuffer {
    let mut out = BitBuffer::new();
    match endian {
        Endian::Big => out.push_bits(raw, size),
        Endian::Little => {
            let mut shift = 0;
            while shift < size {
                let chunk = (size - shift).min(8);
                out.push_bits((raw >> shift) & ((1u64 << chunk) - 1), chunk);
                shift += 8;
            }
        }
    }
    out
}

/// Inverse of [`encode_raw`].
pub fn decode_raw(reader: &mut BitReader<'_>, size: u32, endian: Endian) -> Option<u64> {
    match endian {
        Endian::Big => reader.read_bits(size),
        Endian::Little => {
            if reader.remaining() < size as u64 {
                return None;
            }
            let mut raw = 0u64;
            let mut shift = 0;
            while shift < size {
                let chunk = (size - shift).min(8);
                raw |= reader.read_bits(chunk)? << shift;
                shift += 8;
            }
            Some(raw)
        }
    }
}

pub fn encode_integer(
    value: i128,
    size: u32,
    signed: bool,
    endian: Endian,
) -> Result<BitBuffer, ValueError> {
    check_range(value, size, signed)?;
    let mask = if size == 64 { u64::MAX } else { (1u64 << size) - 1 };
    Ok(encode_raw((value as u64) & mask, size, endian))
}

/// Reinterprets `size` raw bits, sign-extending when `signed`.
pub fn raw_to_integer(raw: u64, size: u32, signed: bool) -> i128 {
    if signed && size > 0 && (raw >> (size - 1)) & 1 == 1 {
        raw as i128 - (1i128 << size)
    } else {
        raw as i128
    }
}

pub fn encode_float(value: f64, size: u32, endian: Endian) -> Result<BitBuffer, ValueError> {
    match size {
        32 => Ok(encode_raw((value as f32).to_bits() as u64, 32, endian)),
        64 => Ok(encode_raw(value.to_bits(), 64, endian)),
        _ => Err(ValueError::Mismatch {
            expected: "32 or 64 bit float",
            found: "other width",
        }),
    }
}

pub fn raw_to_float(raw: u64, size: u32) -> f64 {
    if size == 32 {
        f32::from_bits(raw as u32) as f64
    } else {
        f64::from_bits(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_parsing_accepts_hex_and_sign() {
        assert_eq!(parse_integer("42"), Ok(42));
        assert_eq!(parse_integer(" -0x10 "), Ok(-16));
        assert!(parse_integer("forty").is_err());
    }

    #[test]
    fn hex_parsing_ignores_spacing() {
        assert_eq!(parse_hex("11 22 0x33"), Ok(vec![0x11, 0x22, 0x33]));
        assert_eq!(parse_hex("aabb"), Ok(vec![0xaa, 0xbb]));
        assert!(parse_hex("abc").is_err(), "odd digit count must be rejected");
    }

    #[test]
    fn hex_parsing_rejects_non_ascii_text() {
        let err = parse_hex("aé1").unwrap_err();
        assert_eq!(
            err,
            ValueError::Parse {
                text: "aé1".into(),
                expected: "hex"
            }
        );
        assert!(parse_hex("ü").is_err());
    }

    #[test]
    fn ip_value_types_produce_octets() {
        assert_eq!(
            raw_bytes("10.0.0.1", ValueType::Ipv4),
            Ok(Some(vec![10, 0, 0, 1]))
        );
        let v6 = raw_bytes("::1", ValueType::Ipv6).unwrap().unwrap();
        assert_eq!(v6.len(), 16);
        assert_eq!(v6[15], 1);
        assert_eq!(raw_bytes("x", ValueType::String), Ok(None));
    }

    #[test]
    fn little_endian_partial_byte_holds_high_bits() {
        let bits = encode_integer(0xabc, 12, false, Endian::Little).unwrap();
        assert_eq!(bits.len_bits(), 12);
        assert_eq!(bits.read_u64(0, 8), 0xbc);
        assert_eq!(bits.read_u64(8, 4), 0xa);

        let bytes = bits.as_bytes().to_vec();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(decode_raw(&mut reader, 12, Endian::Little), Some(0xabc));
    }

    #[test]
    fn signed_values_use_twos_complement() {
        let bits = encode_integer(-2, 8, true, Endian::Big).unwrap();
        assert_eq!(bits.as_bytes(), &[0xfe]);
        assert_eq!(raw_to_integer(0xfe, 8, true), -2);
        assert_eq!(raw_to_integer(0xfe, 8, false), 254);
        let full = encode_integer(-1, 64, true, Endian::Little).unwrap();
        assert_eq!(full.as_bytes(), &[0xff; 8]);
    }

    #[test]
    fn range_is_enforced() {
        assert!(encode_integer(256, 8, false, Endian::Big).is_err());
        assert!(encode_integer(-129, 8, true, Endian::Big).is_err());
        assert!(encode_integer(-1, 8, false, Endian::Big).is_err());
        assert!(encode_integer(127, 8, true, Endian::Big).is_ok());
    }

    #[test]
    fn strings_encode_per_encoding() {
        assert_eq!(StringEncoding::Utf16.encode("A").unwrap(), vec![0x41, 0]);
        assert_eq!(StringEncoding::Utf16Be.encode("A").unwrap(), vec![0, 0x41]);
        assert_eq!(StringEncoding::Utf32.encode("A").unwrap(), vec![0x41, 0, 0, 0]);
        assert!(StringEncoding::Ascii.encode("é").is_err());
        assert_eq!(
            StringEncoding::Utf16Be.decode(&[0, 0x48, 0, 0x69]).unwrap(),
            "Hi"
        );
    }

    #[test]
    fn floats_round_trip_through_raw_bits() {
        let bits = encode_float(1.5, 64, Endian::Big).unwrap();
        assert_eq!(raw_to_float(bits.read_u64(0, 64), 64), 1.5);
        let single = encode_float(0.25, 32, Endian::Little).unwrap();
        let bytes = single.as_bytes().to_vec();
        let mut reader = BitReader::new(&bytes);
        let raw = decode_raw(&mut reader, 32, Endian::Little).unwrap();
        assert_eq!(raw_to_float(raw, 32), 0.25);
    }
}

//! Buffer marshalling
//!
//! Stateless conversion between [`Value`] and the fixed-size byte buffers
//! that kernel map keys, map values, and perf samples are made of.

use crate::error::{Error, Result};
use crate::value::Value;

/// Widest integer the kernel-facing encoding can hold: one `u64` slot,
/// with negatives stored as two's complement.
const INT_MIN: i128 = i64::MIN as i128;
const INT_MAX: i128 = u64::MAX as i128;

/// Encode `value` into exactly `size` zero-initialized bytes.
///
/// Integers are written little-endian and truncated when the buffer is
/// narrower than 8 bytes; integers outside the 8-byte encodable range fail
/// with [`Error::ValueTooLarge`]. Byte strings are copied left-aligned and
/// zero-padded. Text is copied left-aligned with a NUL terminator that must
/// also fit. Lists and structs have no fixed-size encoding and fail with
/// [`Error::UnsupportedType`].
pub fn value_to_bytes(value: &Value, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];

    match value {
        Value::Int(v) => {
            let raw = encode_int(*v)?;
            let n = size.min(raw.len());
            buf[..n].copy_from_slice(&raw[..n]);
        }
        Value::Bytes(b) => {
            if b.len() > size {
                return Err(Error::ValueTooLarge {
                    size: b.len(),
                    capacity: size,
                });
            }
            buf[..b.len()].copy_from_slice(b);
        }
        Value::Str(s) => {
            let bytes = s.as_bytes();
            if bytes.len() + 1 > size {
                return Err(Error::ValueTooLarge {
                    size: bytes.len() + 1,
                    capacity: size,
                });
            }
            buf[..bytes.len()].copy_from_slice(bytes);
            // NUL terminator; the length check above reserved its slot.
            buf[bytes.len()] = 0;
        }
        other => {
            return Err(Error::UnsupportedType {
                kind: other.kind_name(),
            });
        }
    }

    Ok(buf)
}

/// Decode a fixed-size buffer into a host value.
///
/// Size-based: a 4-byte buffer always decodes as an unsigned 32-bit
/// integer, an 8-byte buffer as an unsigned 64-bit integer, and every other
/// size as raw bytes. A 4- or 8-byte payload that is semantically raw
/// bytes is indistinguishable here; callers needing the raw buffer must
/// re-encode from the integer.
pub fn bytes_to_value(data: &[u8]) -> Value {
    match data.len() {
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(data);
            Value::Int(u32::from_le_bytes(raw).into())
        }
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(data);
            Value::Int(u64::from_le_bytes(raw).into())
        }
        _ => Value::Bytes(data.to_vec()),
    }
}

fn encode_int(v: i128) -> Result<[u8; 8]> {
    if !(INT_MIN..=INT_MAX).contains(&v) {
        return Err(Error::ValueTooLarge {
            size: int_width(v),
            capacity: 8,
        });
    }
    // In-range negatives wrap to their two's-complement u64 image.
    Ok((v as u64).to_le_bytes())
}

/// Minimal byte width able to represent `v`, for error reporting.
fn int_width(v: i128) -> usize {
    let bits = if v >= 0 {
        128 - v.leading_zeros() as usize
    } else {
        129 - v.leading_ones() as usize
    };
    usize::max(1, (bits + 7) / 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_round_trip_u32() {
        let buf = value_to_bytes(&Value::Int(300), 4).unwrap();
        assert_eq!(buf, vec![44, 1, 0, 0]);
        assert_eq!(bytes_to_value(&buf), Value::Int(300));
    }

    #[test]
    fn test_int_round_trip_u64() {
        let buf = value_to_bytes(&Value::Int(1 << 40), 8).unwrap();
        assert_eq!(bytes_to_value(&buf), Value::Int(1 << 40));
    }

    #[test]
    fn test_int_truncates_to_narrow_buffer() {
        // Only the low 4 bytes survive a 4-byte buffer.
        let buf = value_to_bytes(&Value::Int(0x1_0000_0002), 4).unwrap();
        assert_eq!(buf, vec![2, 0, 0, 0]);
    }

    #[test]
    fn test_int_pads_wide_buffer() {
        let buf = value_to_bytes(&Value::Int(7), 16).unwrap();
        assert_eq!(buf[0], 7);
        assert!(buf[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_negative_int_is_twos_complement() {
        let buf = value_to_bytes(&Value::Int(-1), 8).unwrap();
        assert_eq!(buf, vec![0xff; 8]);
        assert_eq!(bytes_to_value(&buf), Value::Int(u64::MAX as i128));
    }

    #[test]
    fn test_int_outside_encodable_range() {
        let too_big = Value::Int(i128::from(u64::MAX) + 1);
        assert!(matches!(
            value_to_bytes(&too_big, 8),
            Err(Error::ValueTooLarge { size: 9, capacity: 8 })
        ));

        let too_small = Value::Int(i128::from(i64::MIN) - 1);
        assert!(matches!(
            value_to_bytes(&too_small, 8),
            Err(Error::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_bytes_padded_right() {
        let buf = value_to_bytes(&Value::Bytes(vec![1, 2, 3]), 6).unwrap();
        assert_eq!(buf, vec![1, 2, 3, 0, 0, 0]);
    }

    #[test]
    fn test_bytes_longer_than_buffer() {
        let result = value_to_bytes(&Value::Bytes(vec![0; 9]), 8);
        assert!(matches!(
            result,
            Err(Error::ValueTooLarge { size: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_str_nul_terminated() {
        let buf = value_to_bytes(&Value::from("abc"), 8).unwrap();
        assert_eq!(&buf[..4], b"abc\0");
        assert_eq!(&buf[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_str_terminator_must_fit() {
        // Three characters fill a 3-byte buffer, leaving no room for NUL.
        assert!(matches!(
            value_to_bytes(&Value::from("abc"), 3),
            Err(Error::ValueTooLarge { size: 4, capacity: 3 })
        ));
        assert!(value_to_bytes(&Value::from("abc"), 4).is_ok());
    }

    #[test]
    fn test_unsupported_kinds() {
        assert!(matches!(
            value_to_bytes(&Value::List(vec![]), 8),
            Err(Error::UnsupportedType { kind: "list" })
        ));
    }

    #[test]
    fn test_decode_heuristic_sizes() {
        assert_eq!(bytes_to_value(&[1, 0, 0, 0]), Value::Int(1));
        assert_eq!(bytes_to_value(&[1, 0, 0, 0, 0, 0, 0, 0]), Value::Int(1));
        for len in [0usize, 1, 2, 3, 5, 6, 7, 9, 16] {
            let data = vec![0xab; len];
            assert_eq!(bytes_to_value(&data), Value::Bytes(data.clone()));
        }
    }

    #[test]
    fn test_round_trip_raw_bytes() {
        let original = Value::Bytes(vec![9, 8, 7, 6, 5]);
        let buf = value_to_bytes(&original, 5).unwrap();
        assert_eq!(bytes_to_value(&buf), original);
    }
}

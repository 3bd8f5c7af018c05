//! # Variable-Length Integer Encoding
//!
//! Length fields inside pages (map id, entry count, child counts, compressed
//! length delta) use a marker-byte varint optimized for small values:
//!
//! | Value range           | Bytes | Format                                 |
//! |-----------------------|-------|----------------------------------------|
//! | 0 - 240               | 1     | `[value]`                              |
//! | 241 - 2287            | 2     | `[241 + (v-240)>>8, (v-240)&FF]`       |
//! | 2288 - 67823          | 3     | `[249, (v-2288)>>8, (v-2288)&FF]`      |
//! | 67824 - 0xFF_FFFF     | 4     | `[250, 3-byte big-endian]`             |
//! | up to 0xFFFF_FFFF     | 5     | `[251, 4-byte big-endian]`             |
//! | up to u64::MAX        | 9     | `[255, 8-byte big-endian]`             |
//!
//! Markers 252-254 are reserved. All functions are allocation-free and
//! stateless.

use eyre::{bail, ensure, Result};

/// Number of bytes `encode_varint` will write for `value`.
pub fn varint_len(value: u64) -> usize {
    if value <= 240 {
        1
    } else if value <= 2287 {
        2
    } else if value <= 67823 {
        3
    } else if value <= 0xFF_FFFF {
        4
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

/// Appends the encoding of `value` to `out` and returns the encoded length.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) -> usize {
    if value <= 240 {
        out.push(value as u8);
        1
    } else if value <= 2287 {
        let v = value - 240;
        out.push(((v >> 8) + 241) as u8);
        out.push((v & 0xFF) as u8);
        2
    } else if value <= 67823 {
        let v = value - 2288;
        out.push(249);
        out.push((v >> 8) as u8);
        out.push((v & 0xFF) as u8);
        3
    } else if value <= 0xFF_FFFF {
        out.push(250);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
        4
    } else if value <= 0xFFFF_FFFF {
        out.push(251);
        out.push((value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
        5
    } else {
        out.push(255);
        out.extend_from_slice(&value.to_be_bytes());
        9
    }
}

/// Decodes a varint from the front of `buf`, returning `(value, bytes_read)`.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    ensure!(!buf.is_empty(), "empty buffer for varint decode");

    let first = buf[0];
    if first <= 240 {
        Ok((first as u64, 1))
    } else if first <= 248 {
        ensure!(buf.len() >= 2, "truncated 2-byte varint");
        Ok((240 + ((first as u64 - 241) << 8) + buf[1] as u64, 2))
    } else if first == 249 {
        ensure!(buf.len() >= 3, "truncated 3-byte varint");
        Ok((2288 + ((buf[1] as u64) << 8) + buf[2] as u64, 3))
    } else if first == 250 {
        ensure!(buf.len() >= 4, "truncated 4-byte varint");
        let value = ((buf[1] as u64) << 16) + ((buf[2] as u64) << 8) + buf[3] as u64;
        Ok((value, 4))
    } else if first == 251 {
        ensure!(buf.len() >= 5, "truncated 5-byte varint");
        let value = ((buf[1] as u64) << 24)
            + ((buf[2] as u64) << 16)
            + ((buf[3] as u64) << 8)
            + buf[4] as u64;
        Ok((value, 5))
    } else if first == 255 {
        ensure!(buf.len() >= 9, "truncated 9-byte varint");
        let value = u64::from_be_bytes(buf[1..9].try_into().unwrap()); // length checked above
        Ok((value, 9))
    } else {
        bail!("invalid varint marker: {}", first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values_round_trip() {
        let boundaries = [
            0u64,
            1,
            240,
            241,
            2287,
            2288,
            67823,
            67824,
            0xFF_FFFF,
            0x100_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            u64::MAX,
        ];

        for &v in &boundaries {
            let mut buf = Vec::new();
            let written = encode_varint(v, &mut buf);
            assert_eq!(written, varint_len(v), "length mismatch for {}", v);
            assert_eq!(written, buf.len());

            let (decoded, read) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(read, written);
        }
    }

    #[test]
    fn lengths_match_the_table() {
        assert_eq!(varint_len(240), 1);
        assert_eq!(varint_len(241), 2);
        assert_eq!(varint_len(2287), 2);
        assert_eq!(varint_len(2288), 3);
        assert_eq!(varint_len(67824), 4);
        assert_eq!(varint_len(0x100_0000), 5);
        assert_eq!(varint_len(0x1_0000_0000), 9);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut buf = Vec::new();
        encode_varint(70_000, &mut buf);
        assert!(decode_varint(&buf[..2]).is_err());
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn reserved_markers_are_rejected() {
        for marker in 252u8..=254 {
            assert!(decode_varint(&[marker, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        }
    }
}

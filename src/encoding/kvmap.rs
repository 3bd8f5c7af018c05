//! # ASCII Header Maps
//!
//! Store headers, chunk headers, and chunk footers are all encoded as ASCII
//! `key:value` pairs separated by commas, e.g.
//! `chunk:7,block:2f,len:3,...`. Values containing a comma or quote are
//! double-quoted with backslash escaping. Keys are plain identifiers and are
//! written in the order given, so a map serialized twice produces identical
//! bytes.
//!
//! Store headers use decimal values (plus a hex `fletcher`); chunk headers
//! and footers use lowercase hex, which keeps their worst-case length known
//! when reserving header space.

use eyre::{bail, Result};
use hashbrown::HashMap;

/// Appends `key:value,` to `buf`, quoting the value if needed.
pub fn append(buf: &mut String, key: &str, value: &str) {
    if !buf.is_empty() {
        buf.push(',');
    }
    buf.push_str(key);
    buf.push(':');
    if value.contains(',') || value.contains('"') {
        buf.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                buf.push('\\');
            }
            buf.push(c);
        }
        buf.push('"');
    } else {
        buf.push_str(value);
    }
}

/// Appends a decimal-encoded integer entry.
pub fn append_u64(buf: &mut String, key: &str, value: u64) {
    append(buf, key, &value.to_string());
}

/// Appends a lowercase-hex-encoded integer entry.
pub fn append_hex(buf: &mut String, key: &str, value: u64) {
    append(buf, key, &format!("{:x}", value));
}

/// Parses a serialized map back into key/value pairs.
pub fn parse(s: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    let mut chars = s.trim_end_matches(['\n', ' ', '\0']).chars().peekable();

    while chars.peek().is_some() {
        let mut key = String::new();
        for c in chars.by_ref() {
            if c == ':' {
                break;
            }
            key.push(c);
        }
        if key.is_empty() {
            bail!("empty key in header map: {:?}", s);
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
        {
            bail!("malformed key {:?} in header map", key);
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => bail!("dangling escape in header map"),
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => bail!("unterminated quote in header map"),
                }
            }
            // consume the trailing comma, if any
            if chars.peek() == Some(&',') {
                chars.next();
            }
        } else {
            for c in chars.by_ref() {
                if c == ',' {
                    break;
                }
                value.push(c);
            }
        }
        map.insert(key, value);
    }
    Ok(map)
}

/// Reads a decimal integer entry, with a default for missing keys.
pub fn read_u64(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| eyre::eyre!("bad decimal value {:?} for key {:?}", v, key)),
    }
}

/// Reads a hex integer entry, with a default for missing keys.
pub fn read_hex(map: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => u64::from_str_radix(v, 16)
            .map_err(|_| eyre::eyre!("bad hex value {:?} for key {:?}", v, key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_entries_round_trip() {
        let mut s = String::new();
        append(&mut s, "H", "3");
        append_u64(&mut s, "blockSize", 4096);
        append_hex(&mut s, "chunk", 255);
        assert_eq!(s, "H:3,blockSize:4096,chunk:ff");

        let map = parse(&s).unwrap();
        assert_eq!(map.get("H").unwrap(), "3");
        assert_eq!(read_u64(&map, "blockSize", 0).unwrap(), 4096);
        assert_eq!(read_hex(&map, "chunk", 0).unwrap(), 255);
    }

    #[test]
    fn quoted_values_round_trip() {
        let mut s = String::new();
        append(&mut s, "name", "a,b\"c\\d");
        append(&mut s, "next", "plain");

        let map = parse(&s).unwrap();
        assert_eq!(map.get("name").unwrap(), "a,b\"c\\d");
        assert_eq!(map.get("next").unwrap(), "plain");
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let map = parse("chunk:1,block:2   \n").unwrap();
        assert_eq!(read_hex(&map, "chunk", 0).unwrap(), 1);
        assert_eq!(read_hex(&map, "block", 0).unwrap(), 2);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let map = parse("pages:a").unwrap();
        assert_eq!(read_hex(&map, "livePages", 10).unwrap(), 10);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(":novalue").is_err());
        assert!(parse("key\u{1}bad:1").is_err());
        assert!(read_u64(&parse("a:xyz").unwrap(), "a", 0).is_err());
    }
}

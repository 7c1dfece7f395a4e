//! URL decoding, size formatting, and other small shared helpers.

/// Percent-decode a path component. `+` is left untouched (only query
/// components treat it as a space, per §4.3).
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = *bytes.get(i + 1)?;
                let lo = *bytes.get(i + 2)?;
                let hi = (hi as char).to_digit(16)?;
                let lo = (lo as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Percent-decode a query key or value: `%HH` hex plus `+` -> space.
pub fn decode_query_component(input: &str) -> Option<String> {
    percent_decode(&input.replace('+', " "))
}

/// Parse `a=b&c=d` query strings. Empty keys are dropped; later duplicate
/// keys overwrite earlier ones, preserving first-seen order otherwise.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };
        let Some(key) = decode_query_component(key) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let value = decode_query_component(value).unwrap_or_default();
        if let Some(existing) = pairs.iter_mut().find(|(k, _)| k == &key) {
            existing.1 = value;
        } else {
            pairs.push((key, value));
        }
    }
    pairs
}

/// Verify every `%HH` escape in `path` is well-formed hex.
pub fn has_valid_percent_encoding(path: &str) -> bool {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let ok = bytes
                .get(i + 1..i + 3)
                .map(|pair| pair.iter().all(|b| (*b as char).is_ascii_hexdigit()))
                .unwrap_or(false);
            if !ok {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

/// Percent-encode an already-decoded query key/value back into wire form,
/// used to rebuild `QUERY_STRING` for the CGI environment (§4.6).
pub fn percent_encode_query(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Format a byte count as a two-decimal human-readable size, per §4.8.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_and_plus_in_query() {
        assert_eq!(decode_query_component("a+b%20c").unwrap(), "a b c");
    }

    #[test]
    fn path_decode_leaves_plus_alone() {
        assert_eq!(percent_decode("a+b%2Fc").unwrap(), "a+b/c");
    }

    #[test]
    fn query_parsing_drops_empty_keys_and_overwrites_dupes() {
        let pairs = parse_query("a=1&=2&a=3");
        assert_eq!(pairs, vec![("a".to_string(), "3".to_string())]);
    }

    #[test]
    fn rejects_malformed_percent_escape() {
        assert!(!has_valid_percent_encoding("/a%2g"));
        assert!(has_valid_percent_encoding("/a%20b"));
    }

    #[test]
    fn query_percent_encode_round_trips_reserved_chars() {
        assert_eq!(percent_encode_query("a b&c"), "a%20b%26c");
        assert_eq!(percent_encode_query("safe-._~"), "safe-._~");
    }

    #[test]
    fn size_formatting_matches_units() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.00KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00MB");
    }
}

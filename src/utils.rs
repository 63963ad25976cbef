//! Response matching, payload formats and charset helpers shared by probes.

use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;

pub const FORMAT_RAW: &str = "raw";
pub const FORMAT_HEX: &str = "hex";

const BASE64_PREFIX: &str = "base64://";

/// Compare a received payload with the configured expectation.
///
/// Unknown formats never match.
pub fn is_match(format: &str, content: &[u8], expected: &str) -> bool {
    let text = String::from_utf8_lossy(content);
    match format {
        "eq" => text == expected,
        "neq" => text != expected,
        "in" => text.contains(expected),
        "nin" => !text.contains(expected),
        "startswith" => text.starts_with(expected),
        "nstartswith" => !text.starts_with(expected),
        "endswith" => text.ends_with(expected),
        "nendswith" => !text.ends_with(expected),
        "reg" => regex_match(expected, &text),
        "nreg" => !regex_match(expected, &text),
        "wildcard" => wildcard_match(expected, &text),
        "nwildcard" => !wildcard_match(expected, &text),
        FORMAT_HEX => match hex::decode(expected.trim()) {
            Ok(bytes) => content == bytes.as_slice(),
            Err(_) => false,
        },
        _ => false,
    }
}

fn regex_match(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(err) => {
            tracing::warn!("invalid match regex {:?}: {}", pattern, err);
            false
        }
    }
}

/// Glob match where `*` is any run and `?` is a single character. The
/// pattern is anchored at the start only, so trailing text is accepted.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    match Regex::new(&expr) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Decode a configured request payload into bytes.
pub fn convert_string_to_bytes(data: &str, format: &str) -> Result<Vec<u8>, hex::FromHexError> {
    match format {
        FORMAT_HEX => hex::decode(data.trim()),
        _ => Ok(data.as_bytes().to_vec()),
    }
}

/// Strip a `base64://` prefix and decode the remainder, with or without
/// padding. A remainder that is not base64 is returned as is, without the
/// prefix. Other strings pass through unchanged.
pub fn decode_base64_value(value: &str) -> String {
    let Some(encoded) = value.strip_prefix(BASE64_PREFIX) else {
        return value.to_string();
    };
    match base64::engine::general_purpose::STANDARD_NO_PAD.decode(encoded.trim().trim_end_matches('=')) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::debug!("keep {:?} undecoded: {}", encoded, e);
            encoded.to_string()
        }
    }
}

/// Decode bytes from a named charset. Unknown charsets fall back to lossy UTF-8.
pub fn decode_charset(bytes: &[u8], charset: &str) -> String {
    let label = charset.trim().to_ascii_lowercase();
    if label.is_empty() || label == "utf-8" || label == "utf8" {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => {
            let (text, _, _) = encoding.decode(bytes);
            text.into_owned()
        }
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn content_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<mediatype>[^;\s]*)\s*;?\s*(?:charset\s*=\s*(?P<charset>[^;\s]*)|)\s*;?\s*").unwrap()
    })
}

/// Split a `Content-Type` header into media type and charset.
pub fn parse_content_type(value: &str) -> (String, String) {
    match content_type_regex().captures(value) {
        Some(caps) => (
            caps.name("mediatype").map(|m| m.as_str().to_string()).unwrap_or_default(),
            caps.name("charset").map(|m| m.as_str().to_string()).unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_modes() {
        assert!(is_match("startswith", b"abcd", "ab"));
        assert!(!is_match("nstartswith", b"abcd", "ab"));
        assert!(is_match("eq", b"ok", "ok"));
        assert!(!is_match("neq", b"ok", "ok"));
        assert!(is_match("in", b"hello world", "lo w"));
        assert!(is_match("nin", b"hello", "xyz"));
        assert!(is_match("endswith", b"abcd", "cd"));
        assert!(is_match("reg", b"status=200", r"status=\d+"));
        assert!(is_match("nreg", b"status=ok", r"status=\d+"));
        assert!(is_match("hex", b"\x01\x02", "0102"));
        assert!(!is_match("bogus", b"x", "x"));
    }

    #[test]
    fn test_wildcard() {
        assert!(is_match("wildcard", b"123", "1*3"));
        assert!(is_match("wildcard", b"1234", "1*3"));
        assert!(!is_match("wildcard", b"12", "1*3"));
        assert!(is_match("wildcard", b"a.c", "a?c"));
        assert!(is_match("nwildcard", b"12", "1*3"));
    }

    #[test]
    fn test_convert_request() {
        assert_eq!(convert_string_to_bytes("ping", "raw").unwrap(), b"ping");
        assert_eq!(convert_string_to_bytes("70696e67", "hex").unwrap(), b"ping");
        assert!(convert_string_to_bytes("zz", "hex").is_err());
    }

    #[test]
    fn test_base64_value() {
        assert_eq!(decode_base64_value("base64://aGVsbG8="), "hello");
        assert_eq!(decode_base64_value("base64://aGVsbG8"), "hello");
        assert_eq!(decode_base64_value("base64://c2VjcmV0"), "secret");
        assert_eq!(decode_base64_value("plain"), "plain");
    }

    #[test]
    fn test_base64_value_fallback() {
        assert_eq!(decode_base64_value("base64://not base64!"), "not base64!");
        assert_eq!(decode_base64_value("base64://a"), "a");
        assert_eq!(decode_base64_value("base64://"), "");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            parse_content_type("text/html; charset=GBK"),
            ("text/html".to_string(), "GBK".to_string())
        );
        assert_eq!(
            parse_content_type("application/json"),
            ("application/json".to_string(), String::new())
        );
    }

    #[test]
    fn test_decode_gbk() {
        // "中文" in GBK
        assert_eq!(decode_charset(&[0xd6, 0xd0, 0xce, 0xc4], "gbk"), "中文");
        assert_eq!(decode_charset(b"plain", ""), "plain");
    }
}

//! Charset recovery for captured bodies
//!
//! Resolution runs an ordered list of independent rules and returns the
//! first match:
//!
//! 1. the `charset=` parameter of the content-type header
//! 2. `<meta charset="...">` in an HTML body
//! 3. `<meta http-equiv="Content-Type" content="...; charset=...">` in an HTML body
//!
//! Bodies are only scanned when the content type indicates HTML.

use std::sync::OnceLock;

use regex::bytes::Regex;

/// A single charset detection rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharsetRule {
    /// `charset=` parameter inside the content-type header
    HeaderParameter,
    /// Short-form `<meta charset>` declaration
    MetaCharset,
    /// Legacy `<meta http-equiv="Content-Type">` declaration
    MetaHttpEquiv,
}

/// Rules in precedence order
pub const RULES: [CharsetRule; 3] = [
    CharsetRule::HeaderParameter,
    CharsetRule::MetaCharset,
    CharsetRule::MetaHttpEquiv,
];

impl CharsetRule {
    /// Apply this rule alone
    ///
    /// Markup rules never look at the body unless `content_type` is HTML.
    #[must_use]
    pub fn apply(self, content_type: Option<&str>, body: &[u8]) -> Option<String> {
        match self {
            Self::HeaderParameter => content_type.and_then(header_parameter),
            Self::MetaCharset => {
                is_html(content_type).then(|| capture(meta_charset(), body))?
            }
            Self::MetaHttpEquiv => {
                is_html(content_type).then(|| capture(meta_http_equiv(), body))?
            }
        }
    }
}

/// Resolve the text encoding of a captured body
#[must_use]
pub fn resolve(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    RULES
        .iter()
        .find_map(|rule| rule.apply(content_type, body))
}

/// Whether a content type denotes an HTML document
#[must_use]
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
}

fn header_parameter(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        non_empty(value.trim().trim_matches(|c| c == '"' || c == '\''))
    })
}

fn meta_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta\s+charset\s*=\s*["']?([^"'\s/>;]+)"#)
            .expect("meta charset pattern is valid")
    })
}

fn meta_http_equiv() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<meta\s+http-equiv\s*=\s*["']?content-type["']?\s+content\s*=\s*["']?[^"'>]*?charset\s*=\s*([^"'\s;>]+)"#,
        )
        .expect("meta http-equiv pattern is valid")
    })
}

fn capture(re: &Regex, body: &[u8]) -> Option<String> {
    let value = re.captures(body)?.get(1)?;
    non_empty(&String::from_utf8_lossy(value.as_bytes()))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_wins_over_markup() {
        let body = br#"<html><head><meta charset="UTF-8"></head></html>"#;
        assert_eq!(
            resolve(Some("text/html; charset=ISO-8859-1"), body).as_deref(),
            Some("ISO-8859-1")
        );
    }

    #[test]
    fn test_meta_charset_fallback() {
        let body = br#"<head><meta charset="Shift_JIS"></head>"#;
        assert_eq!(resolve(Some("text/html"), body).as_deref(), Some("Shift_JIS"));
    }

    #[test]
    fn test_meta_charset_quoting() {
        for body in [
            &b"<META CHARSET='windows-1252'>"[..],
            &b"<meta charset=windows-1252>"[..],
            &b"<meta   charset = \"windows-1252\" />"[..],
        ] {
            assert_eq!(
                resolve(Some("text/html"), body).as_deref(),
                Some("windows-1252")
            );
        }
    }

    #[test]
    fn test_legacy_http_equiv_fallback() {
        let body =
            br#"<meta http-equiv="Content-Type" content="text/html; charset=EUC-JP">"#;
        assert_eq!(resolve(Some("text/html"), body).as_deref(), Some("EUC-JP"));
    }

    #[test]
    fn test_legacy_http_equiv_single_quotes() {
        let body = b"<meta http-equiv='content-type' content='text/html;charset=gb2312'>";
        assert_eq!(resolve(Some("TEXT/HTML"), body).as_deref(), Some("gb2312"));
    }

    #[test]
    fn test_short_form_beats_legacy() {
        let body = br#"<meta http-equiv="Content-Type" content="text/html; charset=EUC-JP"><meta charset="UTF-8">"#;
        assert_eq!(resolve(Some("text/html"), body).as_deref(), Some("UTF-8"));
    }

    #[test]
    fn test_non_html_never_scans_body() {
        let body = br#"<meta charset="UTF-8">"#;
        assert_eq!(resolve(Some("application/json"), body), None);
        assert_eq!(CharsetRule::MetaCharset.apply(Some("application/json"), body), None);
    }

    #[test]
    fn test_missing_content_type_is_absent() {
        assert_eq!(resolve(None, br#"<meta charset="UTF-8">"#), None);
        assert_eq!(resolve(None, b""), None);
    }

    #[test]
    fn test_header_parameter_variants() {
        assert_eq!(header_parameter("text/css; CHARSET=utf-8").as_deref(), Some("utf-8"));
        assert_eq!(
            header_parameter("text/plain; charset=\"latin1\"; format=flowed").as_deref(),
            Some("latin1")
        );
        assert_eq!(header_parameter("text/plain; charset="), None);
        assert_eq!(header_parameter("text/plain"), None);
    }

    #[test]
    fn test_non_utf8_body_is_scanned() {
        let mut body = b"\xff\xfe<meta charset=\"Big5\">".to_vec();
        body.extend_from_slice(&[0xa4, 0xa4]);
        assert_eq!(resolve(Some("text/html"), &body).as_deref(), Some("Big5"));
    }

    proptest! {
        #[test]
        fn prop_header_parameter_wins(
            charset in "[A-Za-z][A-Za-z0-9_-]{0,15}",
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let ct = format!("text/html; charset={charset}");
            prop_assert_eq!(resolve(Some(&ct), &body), Some(charset));
        }

        #[test]
        fn prop_non_html_is_absent(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert_eq!(resolve(Some("application/octet-stream"), &body), None);
        }
    }
}

//! Ordered header model and sanitization for re-emission

use serde::{Deserialize, Serialize};

/// Header name carrying the media type
pub const CONTENT_TYPE: &str = "content-type";

/// Ordered list of (name, value) header pairs
///
/// Name casing and order are preserved exactly as observed. Lookups are
/// case-insensitive on the name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    /// Create an empty header list
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header, keeping any existing entry with the same name
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content-Type value, if any
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    /// Iterate over (name, value) pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of these headers with CR and LF removed from every value
    #[must_use]
    pub fn strip_line_breaks(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(name, value)| (name.clone(), strip_line_breaks(value)))
                .collect(),
        )
    }

    /// Serialize as a JSON array of `[name, value]` pairs
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::SiteDumpError::Other(format!("Failed to encode headers: {e}")))
    }

    /// Parse the JSON form written by [`HeaderList::to_json`]
    ///
    /// # Errors
    ///
    /// Returns error if the stored text is not a header array
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| crate::SiteDumpError::StoreRead(format!("Malformed stored headers: {e}")))
    }
}

impl From<Vec<(String, String)>> for HeaderList {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl IntoIterator for HeaderList {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Prepare stored headers for re-emission
///
/// Every CR and LF is removed from every value. If `charset` is non-empty and
/// the content-type header carries no `charset` parameter, `; charset=<value>`
/// is appended to it. No content-type header is invented when none exists.
#[must_use]
pub fn sanitize(headers: &HeaderList, charset: Option<&str>) -> HeaderList {
    let mut sanitized = headers.strip_line_breaks();

    let Some(charset) = charset.map(str::trim).filter(|c| !c.is_empty()) else {
        return sanitized;
    };

    if let Some((_, value)) = sanitized
        .0
        .iter_mut()
        .find(|(n, _)| n.eq_ignore_ascii_case(CONTENT_TYPE))
    {
        if !value.to_ascii_lowercase().contains("charset") {
            value.push_str("; charset=");
            value.push_str(charset);
        }
    }

    sanitized
}

fn strip_line_breaks(value: &str) -> String {
    value.chars().filter(|c| !matches!(c, '\r' | '\n')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let h = headers(&[("Content-Type", "text/html"), ("X-Thing", "1")]);
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert_eq!(h.get("x-thing"), Some("1"));
        assert_eq!(h.get("missing"), None);
    }

    #[test]
    fn test_sanitize_strips_crlf() {
        let h = headers(&[("Set-Cookie", "a=1\r\nb=2"), ("X-Lf", "x\ny"), ("X-Cr", "p\rq")]);
        let out = sanitize(&h, None);

        assert_eq!(out.get("set-cookie"), Some("a=1b=2"));
        assert_eq!(out.get("x-lf"), Some("xy"));
        assert_eq!(out.get("x-cr"), Some("pq"));
    }

    #[test]
    fn test_sanitize_appends_charset() {
        let h = headers(&[("content-type", "text/html")]);
        let out = sanitize(&h, Some("Shift_JIS"));
        assert_eq!(out.content_type(), Some("text/html; charset=Shift_JIS"));
    }

    #[test]
    fn test_sanitize_keeps_existing_charset() {
        let h = headers(&[("Content-Type", "text/html; Charset=UTF-8")]);
        let out = sanitize(&h, Some("EUC-JP"));
        assert_eq!(out.content_type(), Some("text/html; Charset=UTF-8"));
    }

    #[test]
    fn test_sanitize_without_content_type_adds_nothing() {
        let h = headers(&[("X-Other", "1")]);
        let out = sanitize(&h, Some("UTF-8"));
        assert_eq!(out, h);
    }

    #[test]
    fn test_sanitize_ignores_empty_charset() {
        let h = headers(&[("Content-Type", "text/html")]);
        let out = sanitize(&h, Some(""));
        assert_eq!(out.content_type(), Some("text/html"));
    }

    #[test]
    fn test_sanitize_preserves_order_and_casing() {
        let h = headers(&[("B-Header", "2"), ("a-header", "1"), ("Content-TYPE", "text/css")]);
        let out = sanitize(&h, Some("utf-8"));
        let names: Vec<_> = out.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["B-Header", "a-header", "Content-TYPE"]);
    }

    #[test]
    fn test_json_round_trip_keeps_duplicates() {
        let h = headers(&[("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]);
        let json = h.to_json().unwrap();
        assert_eq!(json, r#"[["Set-Cookie","a=1"],["Set-Cookie","b=2"]]"#);
        assert_eq!(HeaderList::from_json(&json).unwrap(), h);
    }

    #[test]
    fn test_from_json_rejects_objects() {
        assert!(HeaderList::from_json(r#"{"a":"b"}"#).is_err());
    }

    proptest! {
        #[test]
        fn prop_sanitized_values_have_no_line_breaks(
            values in proptest::collection::vec(".*", 0..8),
            charset in proptest::option::of("[A-Za-z0-9_-]{1,12}"),
        ) {
            let h: HeaderList = values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("X-{i}"), v.clone()))
                .collect::<Vec<_>>()
                .into();
            let out = sanitize(&h, charset.as_deref());

            prop_assert_eq!(out.len(), h.len());
            for (_, value) in out.iter() {
                prop_assert!(!value.contains('\r'));
                prop_assert!(!value.contains('\n'));
            }
        }
    }
}

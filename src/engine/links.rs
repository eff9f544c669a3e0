//! Subresource discovery for fetched HTML documents

use std::sync::OnceLock;

use regex::bytes::Regex;
use url::Url;

fn src_attribute() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<(?:script|img|iframe|source|audio|video|embed|input)\b[^>]*?\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#,
        )
        .expect("src attribute pattern is valid")
    })
}

fn link_href() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<link\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
            .expect("link href pattern is valid")
    })
}

/// Absolute URLs of statically referenced subresources, in document order
///
/// Covers `src` of scripts, images, frames and media, and `href` of `<link>`
/// elements. Duplicates, fragments-only and non-HTTP references are dropped.
#[must_use]
pub fn discover_subresources(base_url: &str, html: &[u8], limit: usize) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for re in [src_attribute(), link_href()] {
        for caps in re.captures_iter(html) {
            let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
                continue;
            };
            let raw = String::from_utf8_lossy(value.as_bytes()).replace("&amp;", "&");
            if let Some(url) = resolve_reference(base_url, raw.trim()) {
                found.push((value.start(), url));
            }
        }
    }

    found.sort_by_key(|(offset, _)| *offset);

    let mut urls: Vec<String> = Vec::new();
    for (_, url) in found {
        if url != base_url && !urls.contains(&url) {
            urls.push(url);
        }
        if urls.len() >= limit {
            break;
        }
    }
    urls
}

/// Resolve `reference` against `base_url` the way a browser would
///
/// The result is percent-encoded and has no fragment. Returns `None` for
/// fragment-only references and anything that does not resolve to an
/// `http(s)` URL.
#[must_use]
pub fn resolve_reference(base_url: &str, reference: &str) -> Option<String> {
    if reference.is_empty() || reference.starts_with('#') {
        return None;
    }

    let mut url = Url::parse(base_url).ok()?.join(reference).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    url.set_fragment(None);
    Some(url.into())
}

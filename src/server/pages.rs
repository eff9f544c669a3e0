//! HTML rendering for the control surface

use std::fmt::Write;

use chrono::FixedOffset;

use crate::storage::{Session, SessionId};

/// Escape text for HTML element and attribute content
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Session list with a dump form, times shown at `offset`
#[must_use]
pub fn index(sessions: &[Session], showing: &[SessionId], offset: FixedOffset) -> String {
    let mut rows = String::new();
    for session in sessions.iter().rev() {
        let url = escape_html(&session.base_url);
        let state = if showing.contains(&session.id) {
            "showing"
        } else {
            ""
        };
        let _ = write!(
            rows,
            "<tr><td>{id}</td><td><a href=\"/show/{id}\">{url}</a></td><td>{created}</td><td>{state}</td></tr>",
            id = session.id,
            created = session
                .created_at
                .with_timezone(&offset)
                .format("%Y-%m-%d %H:%M:%S %:z"),
        );
    }

    format!(
        "<!DOCTYPE html>
<html>
<head><meta charset=\"utf-8\"><title>sitedump</title></head>
<body>
<form method=\"post\" action=\"/dump\">
<input type=\"url\" name=\"url\" placeholder=\"http://example.com/\" required>
<button type=\"submit\">Dump</button>
</form>
<table>
<thead><tr><th>#</th><th>URL</th><th>Created</th><th></th></tr></thead>
<tbody>
{rows}</tbody>
</table>
</body>
</html>
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">&'"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }

    #[test]
    fn test_index_shows_times_at_offset() {
        let sessions = vec![Session {
            id: 1,
            base_url: "http://a.test/".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 20, 30, 0).unwrap(),
        }];
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();

        let html = index(&sessions, &[], tokyo);
        assert!(html.contains("2024-03-02 05:30:00 +09:00"), "{html}");
    }

    #[test]
    fn test_index_lists_newest_first() {
        let sessions = vec![
            Session {
                id: 1,
                base_url: "http://a.test/".to_string(),
                created_at: Utc::now(),
            },
            Session {
                id: 2,
                base_url: "http://b.test/?q=<x>".to_string(),
                created_at: Utc::now(),
            },
        ];
        let html = index(&sessions, &[1], FixedOffset::east_opt(0).unwrap());

        let first = html.find("/show/2").unwrap();
        let second = html.find("/show/1").unwrap();
        assert!(first < second);
        assert!(html.contains("q=&lt;x&gt;"));
        assert!(html.contains("showing"));
    }
}

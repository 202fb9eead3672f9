//! Minimal XML helpers for EC2 query API responses
//!
//! EC2 answers with flat, namespace-qualified documents. Only element text and nested
//! sections are needed, so this avoids a full XML parser.

/// Text of the first `<tag>` element
pub fn text<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    section(doc, tag).map(str::trim)
}

/// Inner content of the first `<tag>` element
pub fn section<'a>(doc: &'a str, tag: &str) -> Option<&'a str> {
    sections(doc, tag).into_iter().next()
}

/// Inner content of every top-level `<tag>` element, in document order
pub fn sections<'a>(doc: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = doc;

    while let Some(start) = rest.find(&open) {
        let body = &rest[start + open.len()..];
        // Track nesting so that <item> inside <item> is not cut short
        let mut depth = 1usize;
        let mut cursor = 0usize;
        let mut end = None;
        while depth > 0 {
            let next_open = body[cursor..].find(&open).map(|i| i + cursor);
            let next_close = match body[cursor..].find(&close) {
                Some(i) => i + cursor,
                None => break,
            };
            match next_open {
                Some(o) if o < next_close => {
                    depth += 1;
                    cursor = o + open.len();
                }
                _ => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(next_close);
                    }
                    cursor = next_close + close.len();
                }
            }
        }
        match end {
            Some(end) => {
                out.push(&body[..end]);
                rest = &body[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

/// Decode the five predefined XML entities
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<DescribeSnapshotsResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <snapshotSet>
        <item><snapshotId>snap-1</snapshotId><status>pending</status>
            <tagSet><item><key>vm</key><value>a</value></item></tagSet>
        </item>
        <item><snapshotId>snap-2</snapshotId><status>completed</status></item>
    </snapshotSet>
</DescribeSnapshotsResponse>"#;

    #[test]
    fn test_nested_items() {
        let set = section(DOC, "snapshotSet").unwrap();
        let items = sections(set, "item");
        assert_eq!(items.len(), 2);
        assert_eq!(text(items[0], "snapshotId"), Some("snap-1"));
        assert_eq!(text(items[1], "status"), Some("completed"));
    }

    #[test]
    fn test_missing_tag() {
        assert_eq!(text(DOC, "volumeId"), None);
        assert!(sections("<a><b>unterminated", "b").is_empty());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("a &amp;lt; b &lt; c"), "a &lt; b < c");
    }
}

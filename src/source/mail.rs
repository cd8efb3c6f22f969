//! Mail parsing and body normalization.
//!
//! Pure functions: no network, no LLM.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use mail_parser::{Message, MessageParser};

use crate::source::RawItem;

/// Bodies longer than this are cut before storage.
pub const MAX_BODY_CHARS: usize = 5000;

/// Parse an RFC 5322 message into a [`RawItem`].
///
/// `fallback_id` is used when the message carries no Message-ID header.
/// Returns `None` if the bytes are not a parseable message.
pub fn parse_message(raw: &[u8], fallback_id: &str) -> Option<RawItem> {
    let parsed = MessageParser::default().parse(raw)?;

    let external_id = parsed
        .message_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback_id.to_string());

    Some(RawItem {
        external_id,
        sender: sender_address(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").trim().to_string(),
        body: normalize_body(&readable_text(&parsed)),
        received_at: received_at(&parsed).unwrap_or_else(Utc::now),
    })
}

fn sender_address(parsed: &Message<'_>) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".into())
}

fn readable_text(parsed: &Message<'_>) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.into_owned();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(&html);
    }
    String::new()
}

/// Date header converted to UTC, honoring its zone offset.
fn received_at(parsed: &Message<'_>) -> Option<DateTime<Utc>> {
    let d = parsed.date()?;
    let offset_secs = (i32::from(d.tz_hour) * 3600 + i32::from(d.tz_minute) * 60)
        * if d.tz_before_gmt { -1 } else { 1 };
    let offset = FixedOffset::east_opt(offset_secs)?;
    let naive = NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))?
        .and_hms_opt(u32::from(d.hour), u32::from(d.minute), u32::from(d.second))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Strip quoted replies, collapse blank runs, and cap the length.
pub fn normalize_body(body: &str) -> String {
    let stripped = strip_quoted_text(body);
    let mut out = String::with_capacity(stripped.len());
    let mut blank_run = 0;
    for line in stripped.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    truncate_chars(out.trim(), MAX_BODY_CHARS)
}

/// Drop `>` quoted lines and everything after a reply attribution or
/// forwarded-message separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if is_reply_boundary(trimmed) {
            break;
        }
        if !trimmed.starts_with('>') {
            kept.push(line);
        }
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n")
}

fn is_reply_boundary(line: &str) -> bool {
    (line.starts_with("On ") && line.ends_with("wrote:"))
        || (line.starts_with("---") && line.contains("Original Message"))
        || line.starts_with("-----Forwarded message")
        || line == "________________________________"
}

/// Remove tags and decode the handful of entities mail clients emit.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();
    let mut skip_depth = 0usize;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if name == "style" || name == "script" {
                    if tag.starts_with('/') {
                        skip_depth = skip_depth.saturating_sub(1);
                    } else {
                        skip_depth += 1;
                    }
                }
                if matches!(name.as_str(), "br" | "p" | "div" | "li" | "tr") {
                    text.push(' ');
                }
            }
            _ if in_tag => tag.push(ch),
            _ if skip_depth > 0 => {}
            _ => text.push(ch),
        }
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Check a sender address against an allow-list.
///
/// - Empty list → deny all
/// - `*` → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact match, case-insensitive
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    let email = email.to_lowercase();
    let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
    allowed.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry == "*" {
            true
        } else if let Some(d) = entry.strip_prefix('@') {
            domain == d
        } else if entry.contains('@') {
            entry == email
        } else {
            domain == entry
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_lines_removed() {
        let body = "Hello!\n\n> This is quoted\n> Another quoted line\nThanks";
        assert_eq!(strip_quoted_text(body), "Hello!\n\nThanks");
    }

    #[test]
    fn attribution_cuts_rest() {
        let body = "Sounds good!\n\nOn Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:\n> Original message";
        assert_eq!(strip_quoted_text(body), "Sounds good!");
    }

    #[test]
    fn outlook_separator_cuts_rest() {
        let body = "Approved.\n-----Original Message-----\nFrom: someone";
        assert_eq!(strip_quoted_text(body), "Approved.");
    }

    #[test]
    fn html_tags_and_entities() {
        let html = "<html><style>p{color:red}</style><p>Pay&nbsp;invoice &amp; reply</p><br>Thanks</html>";
        assert_eq!(strip_html(html), "Pay invoice & reply Thanks");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn long_body_truncated() {
        let body = "a".repeat(MAX_BODY_CHARS + 100);
        assert_eq!(normalize_body(&body).chars().count(), MAX_BODY_CHARS);
    }

    #[test]
    fn blank_runs_collapsed() {
        assert_eq!(normalize_body("one\n\n\n\ntwo  \n"), "one\n\ntwo");
    }

    #[test]
    fn allowlist_rules() {
        assert!(!is_sender_allowed(&[], "anyone@example.com"));
        assert!(is_sender_allowed(&["*".to_string()], "anyone@example.com"));

        let allowed = vec![
            "boss@company.com".to_string(),
            "@trusted.org".to_string(),
            "partner.io".to_string(),
        ];
        assert!(is_sender_allowed(&allowed, "Boss@Company.com"));
        assert!(is_sender_allowed(&allowed, "x@trusted.org"));
        assert!(is_sender_allowed(&allowed, "y@partner.io"));
        assert!(!is_sender_allowed(&allowed, "y@notpartner.io"));
        assert!(!is_sender_allowed(&allowed, "intern@company.com"));
    }

    #[test]
    fn parse_plain_message() {
        let raw = b"From: Alice <Alice@Example.com>\r\n\
To: me@example.com\r\n\
Subject: Invoice due Friday\r\n\
Message-ID: <abc123@example.com>\r\n\
Date: Wed, 08 May 2024 09:30:00 +0200\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please pay $500 due 2024-05-10.\r\n\
\r\n\
> old thread\r\n";
        let item = parse_message(raw, "fallback").unwrap();
        assert_eq!(item.external_id, "abc123@example.com");
        assert_eq!(item.sender, "alice@example.com");
        assert_eq!(item.subject, "Invoice due Friday");
        assert_eq!(item.body, "Please pay $500 due 2024-05-10.");
        assert_eq!(item.received_at.to_rfc3339(), "2024-05-08T07:30:00+00:00");
    }

    #[test]
    fn missing_message_id_uses_fallback() {
        let raw = b"From: bob@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let item = parse_message(raw, "imap:INBOX:42").unwrap();
        assert_eq!(item.external_id, "imap:INBOX:42");
    }
}

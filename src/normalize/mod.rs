//! Maps one raw RFC 822 message onto an `EmailDocument`.
use chrono::{DateTime, Utc};
use html2text::from_read;
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::errors::{SyncError, SyncResult};
use crate::types::{Category, EmailDocument, RawMessage};

/// Parse `raw` and map it onto a document. Missing headers degrade to empty
/// values; only an unparseable message is an error.
pub fn normalize(
    raw: &RawMessage,
    account_id: &str,
    folder: &str,
    captured_at: DateTime<Utc>,
) -> SyncResult<EmailDocument> {
    let parsed = mailparse::parse_mail(&raw.body)
        .map_err(|e| SyncError::Parse(format!("uid {}: {e}", raw.uid)))?;

    let id = match message_id(&parsed) {
        Some(id) => id,
        None => {
            let fallback = format!("{}:{}:{}", account_id, folder, raw.uid);
            warn!(uid = raw.uid, id = %fallback, "Message has no Message-ID; using UID identity");
            fallback
        }
    };

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or(captured_at);

    Ok(EmailDocument {
        id,
        account_id: account_id.to_string(),
        folder: folder.to_string(),
        subject: parsed.headers.get_first_value("Subject").unwrap_or_default(),
        from: parsed.headers.get_first_value("From").unwrap_or_default(),
        to: recipients(&parsed),
        date,
        body: extract_text(&parsed),
        ai_category: Category::Uncategorized,
        indexed_at: captured_at,
    })
}

fn message_id(parsed: &ParsedMail) -> Option<String> {
    parsed
        .headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Always a list, in header order; groups are flattened.
fn recipients(parsed: &ParsedMail) -> Vec<String> {
    let Some(header) = parsed.headers.get_first_header("To") else {
        return Vec::new();
    };

    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.to_string()],
                MailAddr::Group(group) => group.addrs.iter().map(|a| a.to_string()).collect(),
            })
            .collect(),
        Err(_) => {
            let value = header.get_value();
            if value.trim().is_empty() {
                Vec::new()
            } else {
                vec![value.trim().to_string()]
            }
        }
    }
}

/// Plaintext body: the first text/plain part anywhere in the tree, otherwise
/// the first text/html part rendered to text, otherwise empty.
fn extract_text(parsed: &ParsedMail) -> String {
    if let Some(part) = find_part(parsed, "text/plain") {
        return part.get_body().unwrap_or_default();
    }
    if let Some(part) = find_part(parsed, "text/html") {
        let html = part.get_body().unwrap_or_default();
        return html_to_text(html.as_bytes());
    }
    String::new()
}

fn find_part<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        return parsed
            .ctype
            .mimetype
            .eq_ignore_ascii_case(mimetype)
            .then_some(parsed);
    }
    parsed.subparts.iter().find_map(|part| find_part(part, mimetype))
}

fn html_to_text(html: &[u8]) -> String {
    from_read(html, 80).unwrap_or_default()
}

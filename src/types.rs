use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of labels a document can carry. `Uncategorized` is never
/// produced by a classifier; it is the pre-classification and failure value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Category {
    Interested,
    #[serde(rename = "Not Interested")]
    NotInterested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
    #[default]
    Uncategorized,
}

impl Category {
    /// Labels a classifier is allowed to return.
    pub const CLASSIFIABLE: [Category; 5] = [
        Category::Interested,
        Category::MeetingBooked,
        Category::NotInterested,
        Category::Spam,
        Category::OutOfOffice,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Interested => "Interested",
            Category::NotInterested => "Not Interested",
            Category::MeetingBooked => "Meeting Booked",
            Category::Spam => "Spam",
            Category::OutOfOffice => "Out of Office",
            Category::Uncategorized => "Uncategorized",
        }
    }

    /// Exact match against the classifiable labels. "Uncategorized" is not
    /// accepted here since a classifier answering it is malformed output.
    pub fn from_label(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::CLASSIFIABLE.into_iter().find(|c| c.label() == raw)
    }

    pub fn is_interested(&self) -> bool {
        matches!(self, Category::Interested)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Normalized unit of work, stored in the index keyed by `id`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailDocument {
    pub id: String,
    pub account_id: String,
    pub folder: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub body: String,
    pub ai_category: Category,
    pub indexed_at: DateTime<Utc>,
}

/// What a sync run searches for. Recomputed on every run, never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchScope {
    Since(NaiveDate),
    Unseen,
}

impl FetchScope {
    pub fn backfill(now: DateTime<Utc>, window_days: u32) -> Self {
        FetchScope::Since((now - Duration::days(i64::from(window_days))).date_naive())
    }

    /// IMAP SEARCH criteria for this scope.
    pub fn to_imap_query(&self) -> String {
        match self {
            FetchScope::Since(date) => format!("SINCE {}", date.format("%d-%b-%Y")),
            FetchScope::Unseen => "UNSEEN".to_string(),
        }
    }
}

impl fmt::Display for FetchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchScope::Since(date) => write!(f, "since {date}"),
            FetchScope::Unseen => f.write_str("unseen"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

/// One fetched message as the transport hands it over.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub uid: u32,
    pub body: Vec<u8>,
}

/// Outcome of waiting on the open mailbox for server pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxEvent {
    NewMail,
    Timeout,
    Closed,
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

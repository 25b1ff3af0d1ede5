//! Mail transport seam. The engine only ever talks to `MailTransport`; the
//! IMAP implementation lives in `client`.
mod client;

pub use client::{ImapConnector, ImapTransport};

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::SyncResult;
use crate::types::{FetchScope, MailboxEvent, RawMessage};

/// One authenticated session. Not safe for concurrent commands: every method
/// takes `&mut self`, so a single owner issues them in sequence.
#[async_trait]
pub trait MailTransport: Send {
    async fn select(&mut self, folder: &str) -> SyncResult<()>;

    /// UIDs matching `scope` in the selected folder.
    async fn search(&mut self, scope: &FetchScope) -> SyncResult<Vec<u32>>;

    /// Stream full message bodies without setting \Seen. The stream borrows
    /// the session, so no other command can run until it is dropped.
    async fn fetch<'a>(
        &'a mut self,
        uids: &[u32],
    ) -> SyncResult<BoxStream<'a, SyncResult<RawMessage>>>;

    async fn mark_seen(&mut self, uid: u32) -> SyncResult<()>;

    /// Lightweight keep-alive check.
    async fn status(&mut self, folder: &str) -> SyncResult<()>;

    /// Block until the server pushes a mailbox change or `timeout` elapses.
    async fn wait_for_mail(&mut self, timeout: Duration) -> SyncResult<MailboxEvent>;

    fn is_connected(&self) -> bool;

    async fn logout(&mut self) -> SyncResult<()>;
}

/// Factory for fresh sessions; the supervisor calls it on every (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> SyncResult<Box<dyn MailTransport>>;
}

/// Compact a UID list into an IMAP sequence set ("1:3,7,9:10").
pub fn uid_sequence(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range_str(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_str(start, end));
    parts.join(",")
}

fn range_str(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

#[cfg(test)]
mod tests {
    use super::uid_sequence;

    #[test]
    fn sequence_sets_compress_runs() {
        assert_eq!(uid_sequence(&[9, 1, 2, 3, 7, 10, 3]), "1:3,7,9:10");
        assert_eq!(uid_sequence(&[42]), "42");
        assert_eq!(uid_sequence(&[]), "");
    }
}

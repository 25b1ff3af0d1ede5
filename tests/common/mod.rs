#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use mailpipe::classify::Categorizer;
use mailpipe::errors::{SyncError, SyncResult};
use mailpipe::imap::{Connector, MailTransport};
use mailpipe::notify::Notifier;
use mailpipe::pipeline::Pipeline;
use mailpipe::storage::IndexStore;
use mailpipe::sync::{SyncEngine, SyncSettings};
use mailpipe::types::{Category, EmailDocument, FetchScope, MailboxEvent, RawMessage};

pub const ACCOUNT: &str = "me@example.com";
pub const FOLDER: &str = "INBOX";

pub fn raw_email(message_id: Option<&str>, subject: &str, date: DateTime<Utc>) -> Vec<u8> {
    let mut raw = String::new();
    if let Some(id) = message_id {
        raw.push_str(&format!("Message-ID: {id}\r\n"));
    }
    raw.push_str(&format!(
        "From: Lead <lead@example.org>\r\nTo: {ACCOUNT}\r\nSubject: {subject}\r\nDate: {}\r\n\r\nBody of {subject}\r\n",
        date.to_rfc2822()
    ));
    raw.into_bytes()
}

pub struct FakeMessage {
    pub uid: u32,
    pub date: DateTime<Utc>,
    pub seen: bool,
    pub raw: Vec<u8>,
}

#[derive(Default)]
pub struct MailboxState {
    pub messages: Vec<FakeMessage>,
    pub selects: usize,
    pub searches: Vec<FetchScope>,
    pub fetches: Vec<Vec<u32>>,
    pub marked: Vec<u32>,
    pub status_calls: usize,
    pub fail_search: bool,
    /// Yield a fetch error after this many messages.
    pub fetch_fails_after: Option<usize>,
    pub fail_mark_seen: bool,
    pub fail_status: bool,
    pub events: VecDeque<MailboxEvent>,
}

/// Server-side mailbox shared by every session opened against it.
#[derive(Clone, Default)]
pub struct FakeMailbox(Arc<Mutex<MailboxState>>);

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, uid: u32, message_id: &str, subject: &str, date: DateTime<Utc>) {
        self.deliver_raw(uid, date, raw_email(Some(message_id), subject, date));
    }

    pub fn deliver_raw(&self, uid: u32, date: DateTime<Utc>, raw: Vec<u8>) {
        self.state().messages.push(FakeMessage {
            uid,
            date,
            seen: false,
            raw,
        });
    }

    pub fn push_event(&self, event: MailboxEvent) {
        self.state().events.push_back(event);
    }

    pub fn is_seen(&self, uid: u32) -> bool {
        self.state()
            .messages
            .iter()
            .any(|m| m.uid == uid && m.seen)
    }

    pub fn mark_unseen(&self, uid: u32) {
        for m in self.state().messages.iter_mut().filter(|m| m.uid == uid) {
            m.seen = false;
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MailboxState> {
        self.0.lock().unwrap()
    }

    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            mailbox: self.clone(),
            connected: true,
        }
    }
}

pub struct FakeTransport {
    mailbox: FakeMailbox,
    connected: bool,
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn select(&mut self, _folder: &str) -> SyncResult<()> {
        self.mailbox.state().selects += 1;
        Ok(())
    }

    async fn search(&mut self, scope: &FetchScope) -> SyncResult<Vec<u32>> {
        let mut state = self.mailbox.state();
        state.searches.push(scope.clone());
        if state.fail_search {
            return Err(SyncError::Search("SEARCH timed out".into()));
        }
        let uids = state
            .messages
            .iter()
            .filter(|m| match scope {
                FetchScope::Since(day) => m.date.date_naive() >= *day,
                FetchScope::Unseen => !m.seen,
            })
            .map(|m| m.uid)
            .collect();
        Ok(uids)
    }

    async fn fetch<'a>(
        &'a mut self,
        uids: &[u32],
    ) -> SyncResult<BoxStream<'a, SyncResult<RawMessage>>> {
        let mut state = self.mailbox.state();
        state.fetches.push(uids.to_vec());
        let mut items: Vec<SyncResult<RawMessage>> = state
            .messages
            .iter()
            .filter(|m| uids.contains(&m.uid))
            .map(|m| {
                Ok(RawMessage {
                    uid: m.uid,
                    body: m.raw.clone(),
                })
            })
            .collect();
        if let Some(n) = state.fetch_fails_after {
            items.truncate(n);
            items.push(Err(SyncError::Fetch("stream reset by server".into())));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn mark_seen(&mut self, uid: u32) -> SyncResult<()> {
        let mut state = self.mailbox.state();
        if state.fail_mark_seen {
            return Err(SyncError::FlagUpdate(format!("STORE rejected for uid {uid}")));
        }
        state.marked.push(uid);
        for m in state.messages.iter_mut().filter(|m| m.uid == uid) {
            m.seen = true;
        }
        Ok(())
    }

    async fn status(&mut self, _folder: &str) -> SyncResult<()> {
        let mut state = self.mailbox.state();
        state.status_calls += 1;
        if state.fail_status {
            return Err(SyncError::Protocol("STATUS rejected".into()));
        }
        Ok(())
    }

    async fn wait_for_mail(&mut self, timeout: Duration) -> SyncResult<MailboxEvent> {
        let next = self.mailbox.state().events.pop_front();
        match next {
            Some(MailboxEvent::Closed) => {
                self.connected = false;
                Ok(MailboxEvent::Closed)
            }
            Some(event) => Ok(event),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(MailboxEvent::Timeout)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn logout(&mut self) -> SyncResult<()> {
        self.connected = false;
        Ok(())
    }
}

/// Hands out sessions on `mailbox`. Scripted results are consumed in order;
/// once exhausted every attempt succeeds.
pub struct FakeConnector {
    mailbox: FakeMailbox,
    script: Mutex<VecDeque<bool>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new(mailbox: FakeMailbox, script: &[bool]) -> Self {
        Self {
            mailbox,
            script: Mutex::new(script.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> SyncResult<Box<dyn MailTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let ok = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if ok {
            Ok(Box::new(self.mailbox.transport()))
        } else {
            Err(SyncError::Connection("connection refused".into()))
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, EmailDocument>>,
    pub index_calls: AtomicUsize,
    pub fail_index: AtomicBool,
}

impl MemoryStore {
    pub fn docs(&self) -> Vec<EmailDocument> {
        let mut docs: Vec<_> = self.docs.lock().unwrap().values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    pub fn get(&self, id: &str) -> Option<EmailDocument> {
        self.docs.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn index(&self, doc: &EmailDocument) -> SyncResult<()> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_index.load(Ordering::SeqCst) {
            return Err(SyncError::Index("store offline".into()));
        }
        self.docs.lock().unwrap().insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn update_category(&self, id: &str, category: Category) -> SyncResult<()> {
        if let Some(doc) = self.docs.lock().unwrap().get_mut(id) {
            doc.ai_category = category;
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        let docs = self.list_all(account_id, folder).await?;
        Ok(docs
            .into_iter()
            .filter(|d| d.subject.contains(query) || d.body.contains(query))
            .collect())
    }

    async fn list_all(
        &self,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        Ok(self
            .docs()
            .into_iter()
            .filter(|d| d.account_id == account_id)
            .filter(|d| folder.map_or(true, |f| d.folder == f))
            .collect())
    }

    async fn get_by_id(&self, id: &str) -> SyncResult<Option<EmailDocument>> {
        Ok(self.get(id))
    }
}

type CategorizeFn = dyn Fn(&str) -> SyncResult<Category> + Send + Sync;

/// Categorizer driven by the message subject.
pub struct StubCategorizer {
    decide: Box<CategorizeFn>,
    latency: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubCategorizer {
    pub fn from_fn(decide: impl Fn(&str) -> SyncResult<Category> + Send + Sync + 'static) -> Self {
        Self {
            decide: Box::new(decide),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fixed(category: Category) -> Self {
        Self::from_fn(move |_| Ok(category))
    }

    pub fn failing() -> Self {
        Self::from_fn(|_| Err(SyncError::Classification("model unavailable".into())))
    }
}

#[async_trait]
impl Categorizer for StubCategorizer {
    async fn categorize(&self, subject: &str, _body: &str) -> SyncResult<Category> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.decide)(subject)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_interested(&self, doc: &EmailDocument) -> SyncResult<()> {
        self.sent.lock().unwrap().push(doc.id.clone());
        Ok(())
    }
}

pub struct Harness {
    pub mailbox: FakeMailbox,
    pub store: Arc<MemoryStore>,
    pub categorizer: Arc<StubCategorizer>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new(categorizer: StubCategorizer) -> Self {
        Self::with_backfill(categorizer, 1)
    }

    pub fn with_backfill(categorizer: StubCategorizer, backfill_days: u32) -> Self {
        Self::build(categorizer, backfill_days, 4)
    }

    pub fn with_classify_slots(categorizer: StubCategorizer, slots: usize) -> Self {
        Self::build(categorizer, 1, slots)
    }

    fn build(categorizer: StubCategorizer, backfill_days: u32, classify_slots: usize) -> Self {
        let store = Arc::new(MemoryStore::default());
        let categorizer = Arc::new(categorizer);
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            categorizer.clone(),
            notifier.clone(),
            classify_slots,
        ));
        let engine = Arc::new(SyncEngine::new(
            SyncSettings {
                account_id: ACCOUNT.to_string(),
                folder: FOLDER.to_string(),
                backfill_days,
            },
            pipeline,
        ));
        Self {
            mailbox: FakeMailbox::new(),
            store,
            categorizer,
            notifier,
            engine,
        }
    }
}

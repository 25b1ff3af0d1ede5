use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::imap::MailTransport;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::types::{now_utc, FetchScope, RawMessage};

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub account_id: String,
    pub folder: String,
    pub backfill_days: u32,
}

/// One-way backfill flag: false until the first run finishes, then true for
/// the rest of the process lifetime.
#[derive(Debug, Default)]
pub struct SyncCursor {
    initial_sync_done: AtomicBool,
}

impl SyncCursor {
    pub fn is_done(&self) -> bool {
        self.initial_sync_done.load(Ordering::SeqCst)
    }

    pub fn scope(&self, backfill_days: u32) -> FetchScope {
        if self.is_done() {
            FetchScope::Unseen
        } else {
            FetchScope::backfill(now_utc(), backfill_days)
        }
    }

    /// Returns true only for the call that flipped the flag.
    fn advance(&self) -> bool {
        self.initial_sync_done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// At most one sync run at a time. Acquisition never waits.
#[derive(Debug, Default)]
pub struct SyncLock {
    held: AtomicBool,
}

impl SyncLock {
    pub fn try_acquire(&self) -> Option<SyncLockGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncLockGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Releases the lock on drop, whatever path the run exits through.
#[derive(Debug)]
pub struct SyncLockGuard<'a> {
    lock: &'a SyncLock,
}

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncTrigger {
    MailboxOpened,
    NewMail,
    Watchdog,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run holds the lock.
    Busy,
    /// New-mail pushes are ignored until the backfill has completed.
    BackfillPending,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub scope: Option<FetchScope>,
    pub matched: usize,
    pub fetched: usize,
    pub ingested: usize,
    pub failed: usize,
    pub marked_seen: usize,
    pub flag_failures: usize,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Ran(SyncReport),
}

/// The sync state machine (`Idle` / `Syncing`) for one mailbox folder.
pub struct SyncEngine {
    settings: SyncSettings,
    pipeline: Arc<Pipeline>,
    cursor: SyncCursor,
    lock: SyncLock,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings, pipeline: Arc<Pipeline>) -> Self {
        Self {
            settings,
            pipeline,
            cursor: SyncCursor::default(),
            lock: SyncLock::default(),
        }
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn folder(&self) -> &str {
        &self.settings.folder
    }

    pub async fn trigger(&self, trigger: SyncTrigger, transport: &mut dyn MailTransport) -> SyncOutcome {
        if trigger == SyncTrigger::NewMail && !self.cursor.is_done() {
            debug!(folder = %self.settings.folder, "New mail ignored until backfill completes");
            return SyncOutcome::Skipped(SkipReason::BackfillPending);
        }
        debug!(folder = %self.settings.folder, ?trigger, "Sync triggered");
        self.run(transport).await
    }

    /// One sync run against the already-selected folder.
    pub async fn run(&self, transport: &mut dyn MailTransport) -> SyncOutcome {
        let Some(_guard) = self.lock.try_acquire() else {
            debug!(folder = %self.settings.folder, "Sync already running; trigger dropped");
            return SyncOutcome::Skipped(SkipReason::Busy);
        };

        let started = Instant::now();
        let scope = self.cursor.scope(self.settings.backfill_days);
        let mut report = SyncReport {
            scope: Some(scope.clone()),
            ..SyncReport::default()
        };
        info!(account = %self.settings.account_id, folder = %self.settings.folder, %scope, "Sync started");

        let uids = match transport.search(&scope).await {
            Ok(uids) => uids,
            Err(e) => {
                error!(folder = %self.settings.folder, %scope, error = %e, "Search failed");
                report.error = Some(e.to_string());
                self.finish_initial();
                return SyncOutcome::Ran(report);
            }
        };
        report.matched = uids.len();

        if uids.is_empty() {
            info!(folder = %self.settings.folder, %scope, "No messages to fetch");
            self.finish_initial();
            return SyncOutcome::Ran(report);
        }
        info!(folder = %self.settings.folder, count = uids.len(), "Fetching messages");

        let mut tasks = JoinSet::new();
        let fetch_result = match transport.fetch(&uids).await {
            Ok(mut stream) => {
                let mut stream_error = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(raw) => {
                            report.fetched += 1;
                            self.spawn_pipeline(&mut tasks, raw);
                        }
                        Err(e) => {
                            stream_error = Some(e);
                            break;
                        }
                    }
                }
                stream_error.map_or(Ok(()), Err)
            }
            Err(e) => Err(e),
        };

        // Flag updates need the session, so they run here, after the fetch
        // stream has released it.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => self.complete(transport, outcome, &mut report).await,
                Err(e) => {
                    error!(folder = %self.settings.folder, error = %e, "Pipeline task panicked");
                    report.failed += 1;
                }
            }
        }

        match fetch_result {
            Ok(()) => self.finish_initial(),
            Err(e) => {
                error!(folder = %self.settings.folder, error = %e, "Fetch failed");
                report.error = Some(e.to_string());
            }
        }

        info!(
            folder = %self.settings.folder,
            matched = report.matched,
            fetched = report.fetched,
            ingested = report.ingested,
            failed = report.failed,
            marked_seen = report.marked_seen,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Sync finished"
        );
        SyncOutcome::Ran(report)
    }

    fn spawn_pipeline(&self, tasks: &mut JoinSet<PipelineOutcome>, raw: RawMessage) {
        let pipeline = Arc::clone(&self.pipeline);
        let account_id = self.settings.account_id.clone();
        let folder = self.settings.folder.clone();

        tasks.spawn(async move { pipeline.process(raw, &account_id, &folder).await });
    }

    async fn complete(
        &self,
        transport: &mut dyn MailTransport,
        outcome: PipelineOutcome,
        report: &mut SyncReport,
    ) {
        if !outcome.mark_seen {
            report.failed += 1;
            return;
        }
        report.ingested += 1;

        match transport.mark_seen(outcome.uid).await {
            Ok(()) => report.marked_seen += 1,
            Err(e) => {
                warn!(
                    uid = outcome.uid,
                    message_id = ?outcome.message_id,
                    error = %e,
                    "Marking message seen failed; it will be refetched"
                );
                report.flag_failures += 1;
            }
        }
    }

    fn finish_initial(&self) {
        if self.cursor.advance() {
            info!(folder = %self.settings.folder, "Initial sync complete; listening for unseen mail");
        }
    }
}

//! Per-message ingestion: normalize, index, classify, update, notify.
//!
//! Marking the message seen is the caller's job because it needs the mailbox
//! session; `PipelineOutcome::mark_seen` says whether it may happen.
//!
//! Only the classification step is rate limited. Parsing and the first index
//! write run as soon as a message arrives, so a slow model never holds back
//! visibility of other messages.
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::classify::Categorizer;
use crate::errors::SyncError;
use crate::normalize::normalize;
use crate::notify::Notifier;
use crate::storage::IndexStore;
use crate::types::{now_utc, Category, EmailDocument, RawMessage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub uid: u32,
    pub message_id: Option<String>,
    pub category: Option<Category>,
    /// Index and category update both landed.
    pub mark_seen: bool,
}

impl PipelineOutcome {
    fn aborted(uid: u32, message_id: Option<String>) -> Self {
        Self {
            uid,
            message_id,
            category: None,
            mark_seen: false,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn IndexStore>,
    categorizer: Arc<dyn Categorizer>,
    notifier: Arc<dyn Notifier>,
    notifications: TaskTracker,
    classify_slots: Semaphore,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn IndexStore>,
        categorizer: Arc<dyn Categorizer>,
        notifier: Arc<dyn Notifier>,
        classify_concurrency: usize,
    ) -> Self {
        Self {
            store,
            categorizer,
            notifier,
            notifications: TaskTracker::new(),
            classify_slots: Semaphore::new(classify_concurrency.max(1)),
        }
    }

    pub async fn process(&self, raw: RawMessage, account_id: &str, folder: &str) -> PipelineOutcome {
        let started = Instant::now();
        let uid = raw.uid;

        let (account, folder_name) = (account_id.to_string(), folder.to_string());
        let parsed = tokio::task::spawn_blocking(move || {
            normalize(&raw, &account, &folder_name, now_utc())
        })
        .await
        .unwrap_or_else(|e| Err(SyncError::Parse(format!("parser task failed: {e}"))));

        let mut doc = match parsed {
            Ok(doc) => doc,
            Err(e) => {
                warn!(uid, folder, error = %e, "Skipping unparseable message");
                return PipelineOutcome::aborted(uid, None);
            }
        };

        // Visible before classification.
        if let Err(e) = self.store.index(&doc).await {
            error!(uid, message_id = %doc.id, error = %e, "Indexing failed; message left unseen");
            return PipelineOutcome::aborted(uid, Some(doc.id));
        }

        let category = {
            // The semaphore is never closed.
            let _slot = self.classify_slots.acquire().await.ok();
            match self.categorizer.categorize(&doc.subject, &doc.body).await {
                Ok(category) => category,
                Err(e) => {
                    warn!(uid, message_id = %doc.id, error = %e, "Classification failed; using Uncategorized");
                    Category::Uncategorized
                }
            }
        };

        if let Err(e) = self.store.update_category(&doc.id, category).await {
            error!(
                uid,
                message_id = %doc.id,
                category = %category,
                error = %e,
                "Category update failed; message left unseen"
            );
            return PipelineOutcome::aborted(uid, Some(doc.id));
        }
        doc.ai_category = category;

        if category.is_interested() {
            self.spawn_notification(doc.clone());
        }

        info!(
            uid,
            message_id = %doc.id,
            category = %category,
            elapsed_ms = ?started.elapsed().as_millis(),
            "Message ingested"
        );

        PipelineOutcome {
            uid,
            message_id: Some(doc.id),
            category: Some(category),
            mark_seen: true,
        }
    }

    fn spawn_notification(&self, doc: EmailDocument) {
        let notifier = Arc::clone(&self.notifier);
        self.notifications.spawn(async move {
            match notifier.notify_interested(&doc).await {
                Ok(()) => debug!(message_id = %doc.id, "Interested notification delivered"),
                Err(e) => warn!(message_id = %doc.id, error = %e, "Interested notification failed"),
            }
        });
    }

    /// Wait for every notification spawned so far.
    pub async fn drain_notifications(&self) {
        self.notifications.close();
        self.notifications.wait().await;
        self.notifications.reopen();
    }
}

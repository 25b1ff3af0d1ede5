use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirs::home_dir;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::IndexStore;
use crate::errors::{SyncError, SyncResult};
use crate::types::{Category, EmailDocument};

const DB_FILE_NAME: &str = "mailpipe.db";
const LIST_LIMIT: i64 = 100;

/// Local SQLite index, used when no Elasticsearch node is available.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    pub async fn new_default() -> Result<Self> {
        let base = default_data_dir()?;
        Self::open(&base.join(DB_FILE_NAME)).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| format!("connecting to sqlite at {}", db_path.display()))?;

        let store = SqliteStore {
            pool,
            path: db_path.to_path_buf(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS emails (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addrs TEXT NOT NULL,
                date INTEGER NOT NULL,
                body TEXT NOT NULL,
                ai_category TEXT NOT NULL,
                indexed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emails_account ON emails(account_id, folder);
            CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating emails table")?;
        Ok(())
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn index(&self, doc: &EmailDocument) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO emails (
                id, account_id, folder, subject, from_addr, to_addrs,
                date, body, ai_category, indexed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                folder = excluded.folder,
                subject = excluded.subject,
                from_addr = excluded.from_addr,
                to_addrs = excluded.to_addrs,
                date = excluded.date,
                body = excluded.body,
                ai_category = excluded.ai_category,
                indexed_at = excluded.indexed_at;
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.account_id)
        .bind(&doc.folder)
        .bind(&doc.subject)
        .bind(&doc.from)
        .bind(serde_json::to_string(&doc.to).unwrap_or_else(|_| "[]".into()))
        .bind(doc.date.timestamp_millis())
        .bind(&doc.body)
        .bind(doc.ai_category.label())
        .bind(doc.indexed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Index(format!("upserting {}: {e}", doc.id)))?;

        debug!(message_id = %doc.id, "Document indexed (sqlite)");
        Ok(())
    }

    async fn update_category(&self, id: &str, category: Category) -> SyncResult<()> {
        let result = sqlx::query("UPDATE emails SET ai_category = ?1 WHERE id = ?2")
            .bind(category.label())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Index(format!("updating category of {id}: {e}")))?;

        if result.rows_affected() == 0 {
            warn!(message_id = %id, category = %category, "Category update for unknown document ignored");
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, folder, subject, from_addr, to_addrs, date, body, ai_category, indexed_at
            FROM emails
            WHERE account_id = ?1
              AND (?2 IS NULL OR folder = ?2)
              AND (instr(lower(subject), lower(?3)) > 0
                   OR instr(lower(body), lower(?3)) > 0
                   OR instr(lower(from_addr), lower(?3)) > 0)
            ORDER BY date DESC
            LIMIT ?4;
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(query)
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Index(format!("searching {query:?}: {e}")))?;

        rows.iter().map(row_to_document).collect()
    }

    async fn list_all(
        &self,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, folder, subject, from_addr, to_addrs, date, body, ai_category, indexed_at
            FROM emails
            WHERE account_id = ?1 AND (?2 IS NULL OR folder = ?2)
            ORDER BY date DESC
            LIMIT ?3;
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Index(format!("listing documents: {e}")))?;

        rows.iter().map(row_to_document).collect()
    }

    async fn get_by_id(&self, id: &str) -> SyncResult<Option<EmailDocument>> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, folder, subject, from_addr, to_addrs, date, body, ai_category, indexed_at
            FROM emails
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Index(format!("loading {id}: {e}")))?;

        row.as_ref().map(row_to_document).transpose()
    }
}

fn row_to_document(row: &SqliteRow) -> SyncResult<EmailDocument> {
    let id: String = row.get(0);
    let to: Vec<String> = serde_json::from_str(&row.get::<String, _>(5)).unwrap_or_default();
    let category: String = row.get(8);

    Ok(EmailDocument {
        account_id: row.get(1),
        folder: row.get(2),
        subject: row.get(3),
        from: row.get(4),
        to,
        date: millis_to_datetime(row.get(6))
            .ok_or_else(|| SyncError::Index(format!("bad date stored for {id}")))?,
        body: row.get(7),
        ai_category: Category::from_label(&category).unwrap_or(Category::Uncategorized),
        indexed_at: millis_to_datetime(row.get(9))
            .ok_or_else(|| SyncError::Index(format!("bad indexed_at stored for {id}")))?,
        id,
    })
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(custom) = env::var("MAILPIPE_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating MAILPIPE_DATA_DIR at {}", path.display()))?;
        return Ok(path);
    }

    if let Some(home) = home_dir() {
        let path = home.join("mailpipe");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/mailpipe; falling back to workspace-local storage",
                home.display()
            );
        }
    }

    let cwd = env::current_dir().context("determining current directory")?;
    let path = cwd.join("mailpipe-data");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("creating fallback data directory {}", path.display()))?;
    Ok(path)
}

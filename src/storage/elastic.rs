//! Elasticsearch-backed index over its REST API.
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use super::IndexStore;
use crate::errors::{SyncError, SyncResult};
use crate::types::{Category, EmailDocument};

const PAGE_SIZE: usize = 100;

#[derive(Clone, Debug)]
pub struct ElasticStore {
    client: Client,
    base: Url,
    index: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: EmailDocument,
}

impl ElasticStore {
    pub fn new(host: &str, index: &str) -> SyncResult<Self> {
        let base = Url::parse(host)
            .map_err(|e| SyncError::Config(format!("invalid elasticsearch host {host:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Config(format!(
                "elasticsearch host {host:?} cannot be used as a base URL"
            )));
        }
        Ok(Self {
            client: Client::new(),
            base,
            index: index.to_string(),
        })
    }

    /// Ping the node and create the index with its mappings when missing.
    pub async fn connect(&self) -> SyncResult<()> {
        self.client
            .get(self.base.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Index(format!("ping failed: {e}")))?;
        info!(host = %self.base, "Elasticsearch reachable");
        self.ensure_index().await
    }

    async fn ensure_index(&self) -> SyncResult<()> {
        let url = self.url(&[])?;
        let res = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("checking index {}: {e}", self.index)))?;

        if res.status().is_success() {
            debug!(index = %self.index, "Index already exists");
            return Ok(());
        }
        if res.status() != StatusCode::NOT_FOUND {
            return Err(SyncError::Index(format!(
                "checking index {} returned {}",
                self.index,
                res.status()
            )));
        }

        info!(index = %self.index, "Index missing; creating");
        let mappings = json!({
            "mappings": {
                "properties": {
                    "subject": { "type": "text" },
                    "body": { "type": "text" },
                    "from": { "type": "text" },
                    "accountId": { "type": "keyword" },
                    "folder": { "type": "keyword" },
                    "aiCategory": { "type": "keyword" },
                    "date": { "type": "date" },
                    "indexedAt": { "type": "date" }
                }
            }
        });
        self.client
            .put(url)
            .json(&mappings)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Index(format!("creating index {}: {e}", self.index)))?;
        Ok(())
    }

    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config("elasticsearch host cannot be a base".into()))?
            .pop_if_empty()
            .push(&self.index)
            .extend(segments);
        Ok(url)
    }

    async fn run_search(&self, body: Value) -> SyncResult<Vec<EmailDocument>> {
        let res = self
            .client
            .post(self.url(&["_search"])?)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Index(format!("search request failed: {e}")))?;

        let parsed: SearchResponse = res
            .json()
            .await
            .map_err(|e| SyncError::Index(format!("decoding search response: {e}")))?;
        Ok(parsed.hits.hits.into_iter().map(|h| h.source).collect())
    }
}

fn scope_filter(account_id: &str, folder: Option<&str>) -> Vec<Value> {
    let mut filter = vec![json!({ "term": { "accountId": account_id } })];
    if let Some(folder) = folder {
        filter.push(json!({ "term": { "folder": folder } }));
    }
    filter
}

#[async_trait]
impl IndexStore for ElasticStore {
    async fn index(&self, doc: &EmailDocument) -> SyncResult<()> {
        self.client
            .put(self.url(&["_doc", &doc.id])?)
            .json(doc)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Index(format!("indexing {}: {e}", doc.id)))?;

        debug!(message_id = %doc.id, "Document indexed");
        Ok(())
    }

    async fn update_category(&self, id: &str, category: Category) -> SyncResult<()> {
        let res = self
            .client
            .post(self.url(&["_update", id])?)
            .json(&json!({ "doc": { "aiCategory": category } }))
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("updating category of {id}: {e}")))?;

        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                warn!(message_id = %id, category = %category, "Category update for unknown document ignored");
                Ok(())
            }
            s => Err(SyncError::Index(format!(
                "updating category of {id} returned {s}"
            ))),
        }
    }

    async fn search(
        &self,
        query: &str,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        self.run_search(json!({
            "size": PAGE_SIZE,
            "query": {
                "bool": {
                    "must": [{
                        "multi_match": { "query": query, "fields": ["subject", "body", "from"] }
                    }],
                    "filter": scope_filter(account_id, folder)
                }
            }
        }))
        .await
    }

    async fn list_all(
        &self,
        account_id: &str,
        folder: Option<&str>,
    ) -> SyncResult<Vec<EmailDocument>> {
        self.run_search(json!({
            "size": PAGE_SIZE,
            "query": {
                "bool": {
                    "must": [{ "match_all": {} }],
                    "filter": scope_filter(account_id, folder)
                }
            },
            "sort": [{ "date": { "order": "desc" } }]
        }))
        .await
    }

    async fn get_by_id(&self, id: &str) -> SyncResult<Option<EmailDocument>> {
        let res = self
            .client
            .get(self.url(&["_doc", id])?)
            .send()
            .await
            .map_err(|e| SyncError::Index(format!("loading {id}: {e}")))?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let hit: Hit = res
            .error_for_status()
            .map_err(|e| SyncError::Index(format!("loading {id}: {e}")))?
            .json()
            .await
            .map_err(|e| SyncError::Index(format!("decoding document {id}: {e}")))?;
        Ok(Some(hit.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_are_path_escaped() {
        let store = ElasticStore::new("http://localhost:9200/", "emails").unwrap();
        let url = store.url(&["_doc", "<abc/1@mail.example.com>"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9200/emails/_doc/%3Cabc%2F1@mail.example.com%3E"
        );
    }

    #[test]
    fn rejects_non_base_hosts() {
        assert!(matches!(
            ElasticStore::new("mailto:me@example.com", "emails"),
            Err(SyncError::Config(_))
        ));
    }
}

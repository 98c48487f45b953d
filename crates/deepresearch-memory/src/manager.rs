use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use deepresearch_provider::{CompletionRequest, LlmClient};
use deepresearch_schema::memory::{recall_score, MemoryLayer, MemoryRecord, MemoryRole, MemoryStats};
use deepresearch_schema::CoreError;
use tokio::sync::Mutex;
use tracing::warn;

use crate::store::MemoryStore;

const RECALL_DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub content: String,
    pub role: Option<MemoryRole>,
    pub layer: Option<MemoryLayer>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecallRequest {
    pub query: String,
    pub layer: Option<MemoryLayer>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SummarizeResult {
    pub success: bool,
    pub record: Option<MemoryRecord>,
}

/// One enrichment/recall/summarize-capable handle over a user's memory
/// store. `remote_sync` governs whether remote augmentation is attempted
/// (falls back to local-only on failure) and `enrich` an optional LLM
/// client used to tag newly stored content.
pub struct MemoryManager {
    user: String,
    store: MemoryStore,
    remote_sync: bool,
    enrich: Option<Arc<LlmClient>>,
}

impl MemoryManager {
    pub fn new(user: impl Into<String>, store: MemoryStore, remote_sync: bool, enrich: Option<Arc<LlmClient>>) -> Self {
        Self { user: user.into(), store, remote_sync, enrich }
    }

    pub async fn store(&self, request: StoreRequest) -> Result<MemoryRecord, CoreError> {
        let layer = request.layer.unwrap_or(MemoryLayer::Working);
        let role = request.role.unwrap_or(MemoryRole::User);
        let mut record = MemoryRecord::new(layer, role, request.content);
        record.source = request.source;
        record.tags.extend(request.tags.into_iter().map(|t| t.to_lowercase()));
        record.metadata.extend(request.metadata);

        if let Some(client) = &self.enrich {
            match self.enrich_content(client, &record.content).await {
                Ok((tags, metadata, source)) => {
                    record.tags.extend(tags);
                    record.metadata.extend(metadata);
                    if record.source.is_none() {
                        record.source = source;
                    }
                }
                Err(e) => warn!(error = %e, "memory enrichment failed, storing without enrichment"),
            }
        }

        self.store.insert(&self.user, record).await
    }

    async fn enrich_content(
        &self,
        client: &LlmClient,
        content: &str,
    ) -> Result<(Vec<String>, BTreeMap<String, String>, Option<String>), CoreError> {
        let resp = client
            .complete(CompletionRequest {
                system: "Extract tags and metadata for the given note. Respond with JSON only: \
                         {\"tags\": [string], \"metadata\": {string: string}, \"source\": string|null}."
                    .to_string(),
                user: content.to_string(),
                structured: Some("memory-enrichment".to_string()),
                ..Default::default()
            })
            .await?;

        let Some(parsed) = resp.parsed else {
            return Ok((Vec::new(), BTreeMap::new(), None));
        };
        let tags = parsed["tags"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_lowercase)).collect())
            .unwrap_or_default();
        let metadata = parsed["metadata"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let source = parsed["source"].as_str().map(str::to_string);
        Ok((tags, metadata, source))
    }

    pub async fn recall(&self, request: RecallRequest) -> Result<Vec<MemoryRecord>, CoreError> {
        let limit = request.limit.unwrap_or(RECALL_DEFAULT_LIMIT);
        let candidates = self.store.list_for_user(&self.user, request.layer).await?;
        let query_tags: Vec<String> = request.query.split_whitespace().map(str::to_lowercase).collect();

        let mut scored: Vec<MemoryRecord> = candidates
            .into_iter()
            .map(|mut record| {
                record.score = Some(recall_score(&request.query, &query_tags, &record));
                record
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        scored.truncate(limit);

        let mut per_layer: BTreeMap<MemoryLayer, usize> = BTreeMap::new();
        for record in &scored {
            *per_layer.entry(record.layer).or_insert(0) += 1;
        }
        for (layer, count) in per_layer {
            self.store.record_retrieved(&self.user, layer, count).await;
        }

        Ok(scored)
    }

    pub async fn stats(&self) -> Result<MemoryStats, CoreError> {
        self.store.stats_for_user(&self.user).await
    }

    pub async fn summarize(&self, conversation_text: &str, layer: Option<MemoryLayer>) -> SummarizeResult {
        let Some(client) = &self.enrich else {
            return SummarizeResult { success: false, record: None };
        };

        let result = client
            .complete(CompletionRequest {
                system: "Summarize this conversation into 2-4 sentences for long-term memory.".to_string(),
                user: conversation_text.to_string(),
                ..Default::default()
            })
            .await;

        match result {
            Ok(resp) => {
                let record = MemoryRecord::new(
                    layer.unwrap_or(MemoryLayer::Episodic),
                    MemoryRole::System,
                    resp.content,
                );
                match self.store.insert(&self.user, record).await {
                    Ok(stored) => {
                        self.store.record_summarized(&self.user, stored.layer).await;
                        SummarizeResult { success: true, record: Some(stored) }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to persist summary");
                        SummarizeResult { success: false, record: None }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "summarize LLM call failed");
                SummarizeResult { success: false, record: None }
            }
        }
    }

    pub fn remote_sync_enabled(&self) -> bool {
        self.remote_sync
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ManagerKey {
    user: String,
    layer: MemoryLayer,
    remote_sync: bool,
}

/// Per-(user, layer, remote-sync) cache of manager instances, all backed by
/// the same per-user sqlite store. `clear_cache` drops every entry.
pub struct ManagerCache {
    stores: Mutex<HashMap<String, MemoryStore>>,
    managers: Mutex<HashMap<ManagerKey, Arc<MemoryManager>>>,
    storage_dir: String,
    enrich: Option<Arc<LlmClient>>,
}

impl ManagerCache {
    pub fn new(storage_dir: impl Into<String>, enrich: Option<Arc<LlmClient>>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            managers: Mutex::new(HashMap::new()),
            storage_dir: storage_dir.into(),
            enrich,
        }
    }

    pub async fn get_or_create(
        &self,
        user: &str,
        layer: MemoryLayer,
        remote_sync: bool,
    ) -> Result<Arc<MemoryManager>, CoreError> {
        let key = ManagerKey { user: user.to_string(), layer, remote_sync };
        {
            let managers = self.managers.lock().await;
            if let Some(existing) = managers.get(&key) {
                return Ok(Arc::clone(existing));
            }
        }

        let store = self.store_for_user(user).await?;
        let manager = Arc::new(MemoryManager::new(user, store, remote_sync, self.enrich.clone()));
        self.managers.lock().await.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    async fn store_for_user(&self, user: &str) -> Result<MemoryStore, CoreError> {
        let mut stores = self.stores.lock().await;
        if let Some(existing) = stores.get(user) {
            return Ok(existing.clone());
        }
        let path = format!("{}/{}.sqlite3", self.storage_dir, sanitize_user(user));
        let store = MemoryStore::open(&path)?;
        stores.insert(user.to_string(), store.clone());
        Ok(store)
    }

    pub async fn clear_cache(&self) {
        self.managers.lock().await.clear();
        self.stores.lock().await.clear();
    }
}

fn sanitize_user(user: &str) -> String {
    user.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemoryManager {
        MemoryManager::new("alice", MemoryStore::open_in_memory().unwrap(), false, None)
    }

    #[tokio::test]
    async fn store_then_recall_finds_record_by_content() {
        let mgr = manager();
        let stored = mgr
            .store(StoreRequest { content: "Rust ownership rules".to_string(), ..Default::default() })
            .await
            .unwrap();

        let recalled = mgr
            .recall(RecallRequest { query: "ownership".to_string(), ..Default::default() })
            .await
            .unwrap();
        assert!(recalled.iter().any(|r| r.id == stored.id));
    }

    #[tokio::test]
    async fn recall_orders_by_tag_overlap_then_recency() {
        let mgr = manager();
        mgr.store(StoreRequest {
            content: "alpha".to_string(),
            layer: Some(MemoryLayer::Episodic),
            tags: vec!["a".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
        mgr.store(StoreRequest {
            content: "alpha beta".to_string(),
            layer: Some(MemoryLayer::Episodic),
            tags: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
        mgr.store(StoreRequest {
            content: "beta".to_string(),
            layer: Some(MemoryLayer::Episodic),
            tags: vec!["b".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

        let recalled = mgr
            .recall(RecallRequest {
                query: "a b".to_string(),
                layer: Some(MemoryLayer::Episodic),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recalled[0].content, "alpha beta");
    }

    #[tokio::test]
    async fn summarize_without_enrichment_client_fails_gracefully() {
        let mgr = manager();
        let result = mgr.summarize("a long conversation transcript", None).await;
        assert!(!result.success);
        assert!(result.record.is_none());
    }

    #[tokio::test]
    async fn manager_cache_reuses_instances_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManagerCache::new(dir.path().to_string_lossy().to_string(), None);
        let a = cache.get_or_create("alice", MemoryLayer::Working, false).await.unwrap();
        let b = cache.get_or_create("alice", MemoryLayer::Working, false).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        cache.clear_cache().await;
        let c = cache.get_or_create("alice", MemoryLayer::Working, false).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}

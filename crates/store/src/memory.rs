//! In-memory store.

use std::collections::HashMap;

use async_trait::async_trait;
use pipeline::{
    AnalysisResult, Insight, InsightPage, InsightQuery, InsightReader, StoreError, Timestamp,
    WorkItem, WorkItemId, WorkState, WorkStore,
};
use tokio::sync::RwLock;

#[derive(Debug)]
struct Entry {
    item: WorkItem,
    /// Insertion order; breaks `submitted_at` ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct Tables {
    items: HashMap<WorkItemId, Entry>,
    results: HashMap<WorkItemId, AnalysisResult>,
    next_seq: u64,
}

impl Tables {
    fn transition(
        &mut self,
        id: WorkItemId,
        expected: WorkState,
        next: WorkState,
    ) -> Result<(), StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: next,
            });
        }
        let entry = self.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.item.state != expected {
            return Err(StoreError::StateConflict {
                id,
                expected,
                actual: entry.item.state,
            });
        }
        entry.item.state = next;
        entry.item.state_changed_at = Timestamp::now();
        Ok(())
    }

    fn check_result_insertable(&self, id: WorkItemId) -> Result<(), StoreError> {
        if !self.items.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if self.results.contains_key(&id) {
            return Err(StoreError::DuplicateResult(id));
        }
        Ok(())
    }
}

/// Keeps every item and result in a `HashMap` behind one async `RwLock`.
///
/// Each trait call takes the lock once, so [`WorkStore::complete`] is atomic
/// here as well.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently in `state`.
    pub async fn count(&self, state: WorkState) -> usize {
        let tables = self.tables.read().await;
        tables
            .items
            .values()
            .filter(|e| e.item.state == state)
            .count()
    }

    /// Overwrites an item's `state_changed_at`; lets tests age a claim.
    pub async fn backdate(&self, id: WorkItemId, at: Timestamp) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables.items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.item.state_changed_at = at;
        Ok(())
    }
}

#[async_trait]
impl WorkStore for MemoryStore {
    async fn create(&self, item: WorkItem) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.items.contains_key(&item.id) {
            return Err(StoreError::AlreadyExists(item.id));
        }
        let seq = tables.next_seq;
        tables.next_seq += 1;
        tables.items.insert(item.id, Entry { item, seq });
        Ok(())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.items.get(&id).map(|e| e.item.clone()))
    }

    async fn find_by_state(
        &self,
        state: WorkState,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&Entry> = tables
            .items
            .values()
            .filter(|e| e.item.state == state)
            .collect();
        matching.sort_by_key(|e| (e.item.submitted_at, e.seq));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|e| e.item.clone())
            .collect())
    }

    async fn update_state(
        &self,
        id: WorkItemId,
        expected: WorkState,
        next: WorkState,
    ) -> Result<(), StoreError> {
        self.tables.write().await.transition(id, expected, next)
    }

    async fn create_result(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.check_result_insertable(result.work_item_id)?;
        tables.results.insert(result.work_item_id, result);
        Ok(())
    }

    async fn result_for(&self, id: WorkItemId) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.tables.read().await.results.get(&id).cloned())
    }

    async fn complete(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let id = result.work_item_id;
        tables.check_result_insertable(id)?;
        tables.transition(id, WorkState::Processing, WorkState::Completed)?;
        tables.results.insert(id, result);
        Ok(())
    }

    async fn requeue_stale(&self, older_than: Timestamp) -> Result<Vec<WorkItemId>, StoreError> {
        let mut tables = self.tables.write().await;
        let now = Timestamp::now();
        let mut requeued = Vec::new();
        for entry in tables.items.values_mut() {
            if entry.item.state == WorkState::Processing && entry.item.state_changed_at <= older_than
            {
                entry.item.state = WorkState::Pending;
                entry.item.state_changed_at = now;
                requeued.push(entry.item.id);
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl InsightReader for MemoryStore {
    async fn query_insights(&self, query: &InsightQuery) -> Result<InsightPage, StoreError> {
        let tables = self.tables.read().await;
        let mut matches: Vec<(&Entry, &AnalysisResult)> = tables
            .results
            .values()
            .filter_map(|r| tables.items.get(&r.work_item_id).map(|e| (e, r)))
            .filter(|(e, r)| query.matches(&e.item, r))
            .collect();
        matches.sort_by(|(a, _), (b, _)| {
            (b.item.occurred_at, b.seq).cmp(&(a.item.occurred_at, a.seq))
        });

        let total_count = matches.len();
        let insights = matches
            .into_iter()
            .take(query.limit)
            .map(|(e, r)| Insight::from_parts(&e.item, r))
            .collect();
        Ok(InsightPage {
            insights,
            total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{Analysis, WorkPayload};

    use super::*;

    fn item(text: &str) -> WorkItem {
        WorkItem::new(WorkPayload::from_text(text).unwrap(), None, Timestamp::now())
    }

    #[tokio::test]
    async fn failed_complete_leaves_no_result() {
        let store = MemoryStore::new();
        let it = item("hello");
        let id = it.id;
        store.create(it).await.unwrap();

        // Still pending, so completion must be refused as a whole.
        let result = Analysis::fallback(pipeline::FallbackCause::Rejected, "x", "")
            .into_result(id, Timestamp::now());
        let err = store.complete(result).await.unwrap_err();
        assert!(matches!(err, StoreError::StateConflict { .. }));
        assert!(store.result_for(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_refused() {
        let store = MemoryStore::new();
        let it = item("hello");
        store.create(it.clone()).await.unwrap();
        assert!(store.create(it).await.is_err());
        assert_eq!(store.count(WorkState::Pending).await, 1);
    }
}

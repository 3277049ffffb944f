use std::time::Duration;

use lexis_core::EntityKind;
use lexis_storage::RecordStore;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub requested: usize,
    pub deleted_count: usize,
    pub failed_ids: Vec<String>,
    pub batches: usize,
    pub failed_batches: usize,
    pub dry_run: bool,
}

/// Issues deletes in fixed-size batches with a pause between them. A failed
/// batch is recorded and the remaining batches still run.
#[derive(Debug, Clone, Copy)]
pub struct BatchDeleter {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub dry_run: bool,
}

impl Default for BatchDeleter {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_delay: Duration::from_millis(100),
            dry_run: false,
        }
    }
}

impl BatchDeleter {
    pub async fn delete(
        &self,
        store: &dyn RecordStore,
        kind: EntityKind,
        ids: &[String],
    ) -> DeleteOutcome {
        let mut outcome = DeleteOutcome {
            requested: ids.len(),
            dry_run: self.dry_run,
            ..DeleteOutcome::default()
        };
        if self.dry_run {
            info!(%kind, planned = ids.len(), "dry run; skipping deletes");
            return outcome;
        }

        for (batch_no, batch) in ids.chunks(self.batch_size.max(1)).enumerate() {
            if batch_no > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            outcome.batches += 1;
            match store.delete_by_ids(kind, batch).await {
                Ok(removed) => {
                    debug!(%kind, batch_no, requested = batch.len(), removed, "batch deleted");
                    outcome.deleted_count += removed;
                }
                Err(err) => {
                    warn!(%kind, batch_no, ids = batch.len(), error = %err, "delete batch failed");
                    outcome.failed_batches += 1;
                    outcome.failed_ids.extend(batch.iter().cloned());
                }
            }
        }

        info!(
            %kind,
            deleted = outcome.deleted_count,
            failed = outcome.failed_ids.len(),
            batches = outcome.batches,
            "delete phase finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lexis_core::{Section, Token};
    use lexis_storage::{Page, PageRequest, RecordPatch, StoreError};
    use std::sync::Mutex;

    /// Records every delete call; rejects batches containing `poison`.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Vec<String>>>,
        poison: Option<&'static str>,
    }

    #[async_trait]
    impl RecordStore for RecordingStore {
        async fn list_sections(&self, _page: PageRequest) -> Result<Page<Section>, StoreError> {
            Ok(Page {
                records: vec![],
                next_page_token: None,
            })
        }

        async fn list_tokens(&self, _page: PageRequest) -> Result<Page<Token>, StoreError> {
            Ok(Page {
                records: vec![],
                next_page_token: None,
            })
        }

        async fn delete_by_ids(&self, _kind: EntityKind, ids: &[String]) -> Result<usize, StoreError> {
            self.calls.lock().unwrap().push(ids.to_vec());
            if let Some(poison) = self.poison {
                if ids.iter().any(|id| id == poison) {
                    return Err(StoreError::Permanent {
                        operation: "delete_by_ids",
                        message: "rejected".into(),
                    });
                }
            }
            Ok(ids.len())
        }

        async fn update(
            &self,
            _kind: EntityKind,
            _id: &str,
            _patch: &RecordPatch,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id{i:03}")).collect()
    }

    #[tokio::test]
    async fn splits_into_fixed_size_batches() {
        let store = RecordingStore::default();
        let deleter = BatchDeleter {
            batch_size: 4,
            batch_delay: Duration::ZERO,
            dry_run: false,
        };
        let outcome = deleter.delete(&store, EntityKind::Token, &ids(10)).await;
        assert_eq!(outcome.deleted_count, 10);
        assert_eq!(outcome.batches, 3);
        let sizes = store
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn failed_batch_is_recorded_and_later_batches_run() {
        let store = RecordingStore {
            poison: Some("id005"),
            ..RecordingStore::default()
        };
        let deleter = BatchDeleter {
            batch_size: 4,
            batch_delay: Duration::ZERO,
            dry_run: false,
        };
        let outcome = deleter.delete(&store, EntityKind::Token, &ids(10)).await;
        assert_eq!(outcome.deleted_count, 6);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(outcome.failed_ids, vec!["id004", "id005", "id006", "id007"]);
        assert_eq!(store.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dry_run_issues_no_calls() {
        let store = RecordingStore::default();
        let deleter = BatchDeleter {
            dry_run: true,
            ..BatchDeleter::default()
        };
        let outcome = deleter.delete(&store, EntityKind::Section, &ids(3)).await;
        assert_eq!(outcome.requested, 3);
        assert_eq!(outcome.deleted_count, 0);
        assert!(store.calls.lock().unwrap().is_empty());
    }
}

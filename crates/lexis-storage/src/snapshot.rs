use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use lexis_core::{EntityKind, Section, Token};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{Page, PageRequest, RecordPatch, RecordStore, StoreError, DEFAULT_MAX_PAGE_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub tokens: Vec<Token>,
}

#[derive(Debug, Default)]
struct SnapshotState {
    sections: BTreeMap<String, Section>,
    tokens: BTreeMap<String, Token>,
}

#[derive(Debug)]
pub struct SnapshotStore {
    state: Mutex<SnapshotState>,
    max_page_size: usize,
}

impl SnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        let state = SnapshotState {
            sections: snapshot
                .sections
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            tokens: snapshot
                .tokens
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        };
        Self {
            state: Mutex::new(state),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(snapshot))
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    pub async fn insert_sections(&self, sections: impl IntoIterator<Item = Section>) {
        let mut state = self.state.lock().await;
        for section in sections {
            state.sections.insert(section.id.clone(), section);
        }
    }

    pub async fn insert_tokens(&self, tokens: impl IntoIterator<Item = Token>) {
        let mut state = self.state.lock().await;
        for token in tokens {
            state.tokens.insert(token.id.clone(), token);
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        Snapshot {
            sections: state.sections.values().cloned().collect(),
            tokens: state.tokens.values().cloned().collect(),
        }
    }

    pub async fn token(&self, id: &str) -> Option<Token> {
        self.state.lock().await.tokens.get(id).cloned()
    }
}

fn page_of<T: Clone>(
    records: &BTreeMap<String, T>,
    page: &PageRequest,
    limit: usize,
) -> Page<T> {
    let lower = match page.page_token.as_deref() {
        Some(token) => Bound::Excluded(token.to_string()),
        None => Bound::Unbounded,
    };
    let selected = records
        .range((lower, Bound::Unbounded))
        .take(limit)
        .collect::<Vec<_>>();
    let next_page_token = if selected.len() == limit {
        selected.last().map(|(id, _)| (*id).clone())
    } else {
        None
    };
    Page {
        records: selected.into_iter().map(|(_, r)| r.clone()).collect(),
        next_page_token,
    }
}

#[async_trait]
impl RecordStore for SnapshotStore {
    fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    async fn list_sections(&self, page: PageRequest) -> Result<Page<Section>, StoreError> {
        let limit = page.limit.clamp(1, self.max_page_size);
        let state = self.state.lock().await;
        Ok(page_of(&state.sections, &page, limit))
    }

    async fn list_tokens(&self, page: PageRequest) -> Result<Page<Token>, StoreError> {
        let limit = page.limit.clamp(1, self.max_page_size);
        let state = self.state.lock().await;
        Ok(page_of(&state.tokens, &page, limit))
    }

    async fn delete_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let removed = match kind {
            EntityKind::Section => ids
                .iter()
                .filter(|id| state.sections.remove(id.as_str()).is_some())
                .count(),
            EntityKind::Token => ids
                .iter()
                .filter(|id| state.tokens.remove(id.as_str()).is_some())
                .count(),
        };
        Ok(removed)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<(), StoreError> {
        if kind != EntityKind::Token {
            return Err(StoreError::UnsupportedPatch {
                kind,
                patch: patch.name(),
            });
        }
        let mut state = self.state.lock().await;
        let token = state.tokens.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        match patch {
            RecordPatch::SectionRef { section_id } => {
                token.section_id = Some(section_id.clone());
            }
            RecordPatch::Asset { locator, strategy } => {
                token.asset_locator = Some(locator.clone());
                token.asset_strategy = Some(*strategy);
            }
        }
        Ok(())
    }
}

//! Store adapter contracts, retry policy and asset index clients for Lexis.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lexis_core::{EntityKind, MatchStrategy, Section, Token};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

mod assets;
mod pg;
mod snapshot;

pub use assets::{AssetIndex, AssetIndexError, BucketAssetIndex, BucketConfig, DirAssetIndex, MemoryAssetIndex};
pub use pg::PgRecordStore;
pub use snapshot::{Snapshot, SnapshotStore};

pub const CRATE_NAME: &str = "lexis-storage";

pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_) => {
            RetryDisposition::Retryable
        }
        // serialization_failure, deadlock_detected, too_many_connections, admin_shutdown
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001" | "40P01" | "53300" | "57P01") => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure during {operation}: {message}")]
    Transient {
        operation: &'static str,
        message: String,
    },
    #[error("store failure during {operation}: {message}")]
    Permanent {
        operation: &'static str,
        message: String,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("{kind} does not accept {patch} updates")]
    UnsupportedPatch { kind: EntityKind, patch: &'static str },
}

impl StoreError {
    pub fn from_sqlx(operation: &'static str, err: sqlx::Error) -> Self {
        let message = err.to_string();
        match classify_sqlx_error(&err) {
            RetryDisposition::Retryable => StoreError::Transient { operation, message },
            RetryDisposition::NonRetryable => StoreError::Permanent { operation, message },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

impl Retryable for StoreError {
    fn disposition(&self) -> RetryDisposition {
        if self.is_transient() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0usize;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.max_retries =>
                {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page_token: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Field changes the engine is allowed to make. It never creates records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPatch {
    SectionRef { section_id: String },
    Asset { locator: String, strategy: MatchStrategy },
}

impl RecordPatch {
    pub fn name(&self) -> &'static str {
        match self {
            RecordPatch::SectionRef { .. } => "section_ref",
            RecordPatch::Asset { .. } => "asset",
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn max_page_size(&self) -> usize {
        DEFAULT_MAX_PAGE_SIZE
    }

    async fn list_sections(&self, page: PageRequest) -> Result<Page<Section>, StoreError>;

    async fn list_tokens(&self, page: PageRequest) -> Result<Page<Token>, StoreError>;

    /// Ids that no longer exist are not an error.
    async fn delete_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<usize, StoreError>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<(), StoreError>;
}

async fn fetch_all<T, F, Fut>(
    kind: EntityKind,
    page_size: usize,
    mut list_page: F,
) -> Result<Vec<T>, StoreError>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, StoreError>>,
{
    let page_size = page_size.max(1);
    let mut out = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;
    loop {
        let page = list_page(PageRequest {
            page_token: page_token.take(),
            limit: page_size,
        })
        .await?;
        pages += 1;
        let short_page = page.records.len() < page_size;
        out.extend(page.records);
        match page.next_page_token {
            Some(next) if !short_page => page_token = Some(next),
            _ => break,
        }
    }
    debug!(%kind, pages, records = out.len(), "fetched full snapshot");
    Ok(out)
}

pub async fn fetch_all_sections(
    store: &dyn RecordStore,
    page_size: usize,
) -> Result<Vec<Section>, StoreError> {
    let page_size = page_size.min(store.max_page_size());
    fetch_all(EntityKind::Section, page_size, |page| store.list_sections(page)).await
}

pub async fn fetch_all_tokens(
    store: &dyn RecordStore,
    page_size: usize,
) -> Result<Vec<Token>, StoreError> {
    let page_size = page_size.min(store.max_page_size());
    fetch_all(EntityKind::Token, page_size, |page| store.list_tokens(page)).await
}

pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: RecordStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for RetryingStore<S> {
    fn max_page_size(&self) -> usize {
        self.inner.max_page_size()
    }

    async fn list_sections(&self, page: PageRequest) -> Result<Page<Section>, StoreError> {
        self.policy
            .run("list_sections", || self.inner.list_sections(page.clone()))
            .await
    }

    async fn list_tokens(&self, page: PageRequest) -> Result<Page<Token>, StoreError> {
        self.policy
            .run("list_tokens", || self.inner.list_tokens(page.clone()))
            .await
    }

    async fn delete_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<usize, StoreError> {
        self.policy
            .run("delete_by_ids", || self.inner.delete_by_ids(kind, ids))
            .await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<(), StoreError> {
        self.policy
            .run("update", || self.inner.update(kind, id, patch))
            .await
    }
}

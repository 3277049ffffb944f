use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

use crate::{classify_reqwest_error, classify_status, RetryDisposition, RetryPolicy, Retryable};

#[derive(Debug, Error)]
pub enum AssetIndexError {
    #[error("transient asset index failure: {0}")]
    Transient(String),
    #[error("asset {0} not found in index")]
    NotFound(String),
    #[error("asset index failure: {0}")]
    Failed(String),
}

impl AssetIndexError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AssetIndexError::Transient(_))
    }
}

impl Retryable for AssetIndexError {
    fn disposition(&self) -> RetryDisposition {
        if self.is_transient() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

impl From<reqwest::Error> for AssetIndexError {
    fn from(err: reqwest::Error) -> Self {
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => AssetIndexError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => AssetIndexError::Failed(err.to_string()),
        }
    }
}

/// Filenames are index-relative paths using `/` separators.
#[async_trait]
pub trait AssetIndex: Send + Sync {
    async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError>;

    async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError>;

    async fn exists(&self, filename: &str) -> Result<bool, AssetIndexError> {
        let listed = self.list_assets(filename).await?;
        Ok(listed.iter().any(|name| name == filename))
    }
}

#[derive(Debug, Clone)]
pub struct DirAssetIndex {
    root: PathBuf,
}

impl DirAssetIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl AssetIndex for DirAssetIndex {
    async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(AssetIndexError::Failed(format!(
                "asset directory {} does not exist",
                self.root.display()
            )));
        }

        let start_dir = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.root.join(dir),
            None => self.root.clone(),
        };
        if !fs::try_exists(&start_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut pending = vec![start_dir];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|err| {
                AssetIndexError::Failed(format!("reading {}: {err}", dir.display()))
            })?;
            while let Some(entry) = entries.next_entry().await.map_err(|err| {
                AssetIndexError::Failed(format!("reading {}: {err}", dir.display()))
            })? {
                let file_type = entry.file_type().await.map_err(|err| {
                    AssetIndexError::Failed(format!("inspecting {}: {err}", entry.path().display()))
                })?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Some(name) = self.relative_name(&path) {
                    if name.starts_with(prefix) {
                        out.push(name);
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError> {
        let path = self.root.join(filename);
        match fs::canonicalize(&path).await {
            Ok(absolute) => Ok(absolute.display().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AssetIndexError::NotFound(filename.to_string()))
            }
            Err(err) => Err(AssetIndexError::Failed(format!(
                "resolving {}: {err}",
                path.display()
            ))),
        }
    }

    async fn exists(&self, filename: &str) -> Result<bool, AssetIndexError> {
        let path = self.root.join(filename);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AssetIndexError::Failed(format!(
                "inspecting {}: {err}",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub base_url: String,
    pub bucket: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub page_size: usize,
    pub retry: RetryPolicy,
}

impl BucketConfig {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bucket: bucket.into(),
            api_key: None,
            timeout: Duration::from_secs(20),
            page_size: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ListObjectsRequest<'a> {
    prefix: &'a str,
    search: &'a str,
    limit: usize,
    offset: usize,
    #[serde(rename = "sortBy")]
    sort_by: SortBy,
}

#[derive(Debug, Serialize)]
struct SortBy {
    column: &'static str,
    order: &'static str,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
    /// Folders come back without an object id.
    #[serde(default)]
    id: Option<String>,
}

/// Listing is one folder deep. `search` is a substring match upstream, so
/// results are filtered again locally.
#[derive(Debug)]
pub struct BucketAssetIndex {
    client: reqwest::Client,
    config: BucketConfig,
}

impl BucketAssetIndex {
    pub fn new(config: BucketConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    async fn list_page(
        &self,
        folder: &str,
        search: &str,
        offset: usize,
    ) -> Result<Vec<ObjectEntry>, AssetIndexError> {
        let url = format!("{}/storage/v1/object/list/{}", self.base(), self.config.bucket);
        let body = ListObjectsRequest {
            prefix: folder,
            search,
            limit: self.config.page_size,
            offset,
            sort_by: SortBy {
                column: "name",
                order: "asc",
            },
        };
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key).header("apikey", key);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = format!("http status {} for {url}", status.as_u16());
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => AssetIndexError::Transient(message),
                RetryDisposition::NonRetryable => AssetIndexError::Failed(message),
            });
        }
        Ok(resp.json::<Vec<ObjectEntry>>().await?)
    }
}

#[async_trait]
impl AssetIndex for BucketAssetIndex {
    async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError> {
        let (folder, search) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let span = info_span!("bucket_list", bucket = %self.config.bucket, folder);
        async {
            let page_size = self.config.page_size.max(1);
            let mut out = Vec::new();
            let mut offset = 0usize;
            loop {
                let entries = self
                    .config
                    .retry
                    .run("list_assets", || self.list_page(folder, search, offset))
                    .await?;
                let fetched = entries.len();
                out.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.id.is_some() && e.name.starts_with(search))
                        .map(|e| {
                            if folder.is_empty() {
                                e.name
                            } else {
                                format!("{folder}/{}", e.name)
                            }
                        }),
                );
                if fetched < page_size {
                    break;
                }
                offset += fetched;
            }
            debug!(assets = out.len(), "listed bucket assets");
            out.sort();
            Ok::<_, AssetIndexError>(out)
        }
        .instrument(span)
        .await
    }

    async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError> {
        Ok(format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base(),
            self.config.bucket,
            filename.trim_start_matches('/')
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAssetIndex {
    filenames: BTreeSet<String>,
    locator_base: String,
}

impl MemoryAssetIndex {
    pub fn new(locator_base: impl Into<String>) -> Self {
        Self {
            filenames: BTreeSet::new(),
            locator_base: locator_base.into(),
        }
    }

    pub fn with_assets<I, S>(mut self, filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filenames.extend(filenames.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl AssetIndex for MemoryAssetIndex {
    async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError> {
        Ok(self
            .filenames
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError> {
        if !self.filenames.contains(filename) {
            return Err(AssetIndexError::NotFound(filename.to_string()));
        }
        Ok(format!("{}{}", self.locator_base, filename))
    }

    async fn exists(&self, filename: &str) -> Result<bool, AssetIndexError> {
        Ok(self.filenames.contains(filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn dir_index_lists_nested_files_under_prefix() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("words/legacy")).expect("mkdir");
        std::fs::write(dir.path().join("words/abc.svg"), "<svg/>").expect("write");
        std::fs::write(dir.path().join("words/legacy/old.png"), "png").expect("write");
        std::fs::write(dir.path().join("placeholder.svg"), "<svg/>").expect("write");

        let index = DirAssetIndex::new(dir.path());
        let words = index.list_assets("words/").await.expect("list");
        assert_eq!(words, vec!["words/abc.svg", "words/legacy/old.png"]);

        let all = index.list_assets("").await.expect("list all");
        assert_eq!(all.len(), 3);

        let locator = index.resolve_locator("words/abc.svg").await.expect("resolve");
        assert!(Path::new(&locator).is_absolute());
        assert!(locator.ends_with("abc.svg"));

        assert!(matches!(
            index.resolve_locator("words/missing.svg").await,
            Err(AssetIndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn dir_index_checks_a_single_file_without_listing() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("words")).expect("mkdir");
        std::fs::write(dir.path().join("placeholder.svg"), "<svg/>").expect("write");

        let index = DirAssetIndex::new(dir.path());
        assert!(index.exists("placeholder.svg").await.expect("exists"));
        assert!(!index.exists("placeholder.png").await.expect("exists"));
        assert!(!index.exists("words").await.expect("directory is not an asset"));
    }

    #[tokio::test]
    async fn dir_index_with_missing_root_fails_loudly() {
        let index = DirAssetIndex::new("/definitely/not/a/lexis/asset/dir");
        let err = index.list_assets("words/").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn bucket_locators_are_public_object_urls() {
        let index = BucketAssetIndex::new(BucketConfig::new(
            "https://store.example.com/",
            "word-images",
        ))
        .expect("client");
        let url = index.resolve_locator("words/abc.svg").await.unwrap();
        assert_eq!(
            url,
            "https://store.example.com/storage/v1/object/public/word-images/words/abc.svg"
        );
    }

    #[tokio::test]
    async fn memory_index_filters_by_prefix() {
        let index = MemoryAssetIndex::new("https://cdn/")
            .with_assets(["words/a.svg", "words/b.png", "icons/c.svg"]);
        assert_eq!(index.list_assets("words/").await.unwrap().len(), 2);
        assert_eq!(
            index.resolve_locator("icons/c.svg").await.unwrap(),
            "https://cdn/icons/c.svg"
        );
        assert!(index.exists("words/a.svg").await.unwrap());
        assert!(!index.exists("words/a").await.unwrap());
    }
}

//! Duplicate resolution, orphan repair and asset matching for the lexis content store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lexis_assets::{run_asset_matching, MatchError, MatchOptions, MatchReport, MatchingRules, DEFAULT_RULES_PATH};
use lexis_core::{EntityKind, KeyMode, Section, Token};
use lexis_storage::{fetch_all_sections, fetch_all_tokens, AssetIndex, RecordStore, RetryPolicy};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod delete;
mod detect;
mod orphans;
mod sections;

pub use delete::{BatchDeleter, DeleteOutcome};
pub use detect::{detect_duplicates, plan_deletions, select_canonical, CanonicalDecision, Detection};
pub use orphans::{find_orphans, OrphanScan};
pub use sections::{apply_section_merge, plan_section_merge, Relink, SectionMergePlan, SectionReport};

pub const CRATE_NAME: &str = "lexis-reconcile";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub database_url: Option<String>,
    pub page_size: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_retries: usize,
    pub key_mode: KeyMode,
    pub rules_path: PathBuf,
    pub assets_dir: Option<PathBuf>,
    pub asset_bucket_url: Option<String>,
    pub asset_bucket: Option<String>,
    pub asset_bucket_key: Option<String>,
    pub http_timeout_secs: u64,
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            page_size: 1000,
            batch_size: 100,
            batch_delay: Duration::from_millis(100),
            max_retries: 3,
            key_mode: KeyMode::TextSection,
            rules_path: PathBuf::from(DEFAULT_RULES_PATH),
            assets_dir: None,
            asset_bucket_url: None,
            asset_bucket: None,
            asset_bucket_key: None,
            http_timeout_secs: 20,
            dry_run: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_nonempty("DATABASE_URL"),
            page_size: env_parse("LEXIS_PAGE_SIZE", defaults.page_size),
            batch_size: env_parse("LEXIS_BATCH_SIZE", defaults.batch_size),
            batch_delay: Duration::from_millis(env_parse("LEXIS_BATCH_DELAY_MS", 100)),
            max_retries: env_parse("LEXIS_MAX_RETRIES", defaults.max_retries),
            key_mode: if env_flag("LEXIS_KEY_WITH_POSITION") {
                KeyMode::TextSectionPosition
            } else {
                KeyMode::TextSection
            },
            rules_path: env_nonempty("LEXIS_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
            assets_dir: env_nonempty("LEXIS_ASSETS_DIR").map(PathBuf::from),
            asset_bucket_url: env_nonempty("LEXIS_ASSET_BUCKET_URL"),
            asset_bucket: env_nonempty("LEXIS_ASSET_BUCKET"),
            asset_bucket_key: env_nonempty("LEXIS_ASSET_BUCKET_KEY"),
            http_timeout_secs: env_parse("LEXIS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            dry_run: env_flag("LEXIS_DRY_RUN"),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn deleter(&self) -> BatchDeleter {
        BatchDeleter {
            batch_size: self.batch_size.max(1),
            batch_delay: self.batch_delay,
            dry_run: self.dry_run,
        }
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            segment_size: self.batch_size.max(1),
            segment_delay: self.batch_delay,
            retry: self.retry_policy(),
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScopeDetection {
    pub scanned: usize,
    pub excluded_without_key: usize,
    pub duplicate_groups: usize,
    pub surplus_records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups_with_distinct_positions: Option<usize>,
    pub duplicate_keys: Vec<String>,
}

impl ScopeDetection {
    fn from_detection<T: lexis_core::NaturalKeyed>(scanned: usize, detection: &Detection<T>) -> Self {
        Self {
            scanned,
            excluded_without_key: detection.excluded(),
            duplicate_groups: detection.duplicate_group_count(),
            surplus_records: detection.surplus_records(),
            groups_with_distinct_positions: None,
            duplicate_keys: detection.duplicate_keys(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectReport {
    pub key_mode: KeyMode,
    pub sections: ScopeDetection,
    pub tokens: ScopeDetection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub duplicate_groups: usize,
    pub decisions: Vec<CanonicalDecision>,
    pub delete: DeleteOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub found: OrphanScan,
    pub delete: DeleteOutcome,
    /// Orphans still present after the repair pass; not re-scanned on dry runs.
    pub remaining: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub sections_checked: usize,
    pub tokens_checked: usize,
    pub residual_section_keys: Vec<String>,
    pub residual_token_keys: Vec<String>,
}

impl VerificationReport {
    pub fn residual_duplicates(&self) -> usize {
        self.residual_section_keys.len() + self.residual_token_keys.len()
    }

    pub fn is_clean(&self) -> bool {
        self.residual_duplicates() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub deleted: usize,
    pub failed: usize,
    pub residual_duplicates: usize,
    pub orphans_removed: usize,
    pub sections_relinked: usize,
    pub tokens_resolved_by_strategy: BTreeMap<u8, usize>,
    pub segment_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub counts: SummaryCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect: Option<DetectReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<SectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orphans: Option<OrphanReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<MatchReport>,
    pub invariant_violations: Vec<String>,
    pub configuration_error: Option<String>,
    /// Set when a phase failed outright. Writes made before it stand.
    pub fatal_error: Option<String>,
}

impl RunSummary {
    pub fn begin(command: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            command: command.to_string(),
            started_at: now,
            finished_at: now,
            dry_run,
            counts: SummaryCounts::default(),
            detect: None,
            sections: None,
            orphans: None,
            dedup: None,
            verification: None,
            assets: None,
            invariant_violations: Vec::new(),
            configuration_error: None,
            fatal_error: None,
        }
    }

    pub fn configuration_failure(command: &str, dry_run: bool, error: impl std::fmt::Display) -> Self {
        let mut summary = Self::begin(command, dry_run);
        summary.configuration_error = Some(error.to_string());
        summary.finish();
        summary
    }

    pub fn aborted(command: &str, dry_run: bool, error: anyhow::Error) -> Self {
        let mut summary = Self::begin(command, dry_run);
        summary.record_fatal(error);
        summary.finish();
        summary
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn is_clean(&self) -> bool {
        self.configuration_error.is_none()
            && self.fatal_error.is_none()
            && self.invariant_violations.is_empty()
            && self.counts.failed == 0
            && self.counts.segment_failures == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            0
        } else {
            1
        }
    }

    fn record_fatal(&mut self, error: anyhow::Error) {
        let message = format!("{error:#}");
        warn!(error = %message, "run stopped early");
        self.fatal_error = Some(message);
    }

    fn record_sections(&mut self, report: SectionReport) {
        self.counts.sections_relinked += report.tokens_relinked;
        self.counts.deleted += report.delete.deleted_count;
        self.counts.failed += report.relink_failures.len() + report.failed_ids().count();
        self.sections = Some(report);
    }

    fn record_orphans(&mut self, report: OrphanReport) {
        self.counts.orphans_removed += report.delete.deleted_count;
        self.counts.failed += report.delete.failed_ids.len();
        if let Some(remaining) = report.remaining.filter(|n| *n > 0) {
            self.invariant_violations
                .push(format!("{remaining} orphan tokens remain after repair"));
        }
        self.orphans = Some(report);
    }

    fn record_dedup(&mut self, report: DedupReport) {
        self.counts.deleted += report.delete.deleted_count;
        self.counts.failed += report.delete.failed_ids.len();
        self.dedup = Some(report);
    }

    fn record_verification(&mut self, report: VerificationReport) {
        self.counts.residual_duplicates = report.residual_duplicates();
        if !report.residual_section_keys.is_empty() {
            self.invariant_violations.push(format!(
                "duplicate sections remain: {}",
                report.residual_section_keys.join(", ")
            ));
        }
        if !report.residual_token_keys.is_empty() {
            self.invariant_violations.push(format!(
                "duplicate tokens remain: {}",
                report.residual_token_keys.join(", ")
            ));
        }
        self.verification = Some(report);
    }

    fn record_matching(&mut self, report: MatchReport) {
        for (strategy, count) in &report.resolved_by_strategy {
            *self.counts.tokens_resolved_by_strategy.entry(*strategy).or_default() += count;
        }
        self.counts.segment_failures += report.segment_failures.len();
        self.counts.failed += report.update_failures.len();
        self.assets = Some(report);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detect,
    Sections,
    Orphans,
    Delete,
    Verify,
}

impl Phase {
    /// Sections run first because relinking can create new token duplicates.
    pub const RECONCILE: [Phase; 4] = [Phase::Sections, Phase::Orphans, Phase::Delete, Phase::Verify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Detect => "detect",
            Phase::Sections => "sections",
            Phase::Orphans => "orphans",
            Phase::Delete => "delete",
            Phase::Verify => "verify",
        }
    }
}

/// Runs phases against one store. Every phase re-derives its state from the
/// store, so any phase can be re-run after an interruption.
pub struct Reconciler<'a> {
    store: &'a dyn RecordStore,
    config: &'a ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn RecordStore, config: &'a ReconcileConfig) -> Self {
        Self { store, config }
    }

    async fn load_sections(&self) -> Result<Vec<Section>> {
        fetch_all_sections(self.store, self.config.page_size)
            .await
            .context("fetching sections")
    }

    async fn load_tokens(&self) -> Result<Vec<Token>> {
        fetch_all_tokens(self.store, self.config.page_size)
            .await
            .context("fetching tokens")
    }

    pub async fn detect(&self) -> Result<DetectReport> {
        let sections = self.load_sections().await?;
        let tokens = self.load_tokens().await?;

        let section_count = sections.len();
        let section_detection = detect_duplicates(sections, KeyMode::default());
        let token_count = tokens.len();
        let token_detection = detect_duplicates(tokens, self.config.key_mode);

        let mut token_scope = ScopeDetection::from_detection(token_count, &token_detection);
        token_scope.groups_with_distinct_positions =
            Some(token_detection.groups_with_distinct_positions());

        info!(
            section_groups = section_detection.duplicate_group_count(),
            token_groups = token_detection.duplicate_group_count(),
            surplus_tokens = token_detection.surplus_records(),
            excluded = token_detection.excluded(),
            "duplicate detection finished"
        );
        Ok(DetectReport {
            key_mode: self.config.key_mode,
            sections: ScopeDetection::from_detection(section_count, &section_detection),
            tokens: token_scope,
        })
    }

    pub async fn reconcile_sections(&self) -> Result<SectionReport> {
        let sections = self.load_sections().await?;
        let tokens = self.load_tokens().await?;
        let plan = plan_section_merge(&sections, &tokens);
        info!(
            groups = plan.decisions.len(),
            relinks = plan.relinks.len(),
            "section merge planned"
        );
        Ok(apply_section_merge(self.store, &plan, &self.config.deleter()).await)
    }

    pub async fn resolve_orphans(&self) -> Result<OrphanReport> {
        let sections = self.load_sections().await?;
        let tokens = self.load_tokens().await?;
        let found = find_orphans(&sections, &tokens);
        info!(
            null_section = found.null_section.len(),
            missing_section = found.missing_section.len(),
            "orphan scan finished"
        );

        let delete = self
            .config
            .deleter()
            .delete(self.store, EntityKind::Token, &found.ids())
            .await;

        let remaining = if self.config.dry_run || found.is_empty() {
            None
        } else {
            let sections = self.load_sections().await?;
            let tokens = self.load_tokens().await?;
            let left = find_orphans(&sections, &tokens).total();
            if left > 0 {
                warn!(remaining = left, "orphans survived repair");
            }
            Some(left)
        };

        Ok(OrphanReport {
            found,
            delete,
            remaining,
        })
    }

    pub async fn delete_duplicates(&self) -> Result<DedupReport> {
        let tokens = self.load_tokens().await?;
        let detection = detect_duplicates(tokens, self.config.key_mode);
        let decisions = plan_deletions(&detection);
        let ids = decisions
            .iter()
            .flat_map(|d| d.delete_ids.iter().cloned())
            .collect::<Vec<_>>();
        info!(
            groups = decisions.len(),
            scheduled = ids.len(),
            "canonical records selected"
        );

        let delete = self
            .config
            .deleter()
            .delete(self.store, EntityKind::Token, &ids)
            .await;
        Ok(DedupReport {
            duplicate_groups: decisions.len(),
            decisions,
            delete,
        })
    }

    pub async fn verify(&self) -> Result<VerificationReport> {
        let sections = self.load_sections().await?;
        let tokens = self.load_tokens().await?;
        let report = VerificationReport {
            sections_checked: sections.len(),
            tokens_checked: tokens.len(),
            residual_section_keys: detect_duplicates(sections, KeyMode::default()).duplicate_keys(),
            residual_token_keys: detect_duplicates(tokens, self.config.key_mode).duplicate_keys(),
        };
        if report.is_clean() {
            info!(
                sections = report.sections_checked,
                tokens = report.tokens_checked,
                "verification clean"
            );
        } else {
            warn!(
                residual = report.residual_duplicates(),
                keys = ?report.residual_token_keys,
                "verification found residual duplicates"
            );
        }
        Ok(report)
    }

    async fn run_phase(&self, phase: Phase, summary: &mut RunSummary) -> Result<()> {
        match phase {
            Phase::Detect => summary.detect = Some(self.detect().await?),
            Phase::Sections => summary.record_sections(self.reconcile_sections().await?),
            Phase::Orphans => summary.record_orphans(self.resolve_orphans().await?),
            Phase::Delete => summary.record_dedup(self.delete_duplicates().await?),
            Phase::Verify => summary.record_verification(self.verify().await?),
        }
        Ok(())
    }

    /// Run `phases` in order and collect their reports into one summary. A
    /// failing phase stops the run; the summary keeps what earlier phases did.
    pub async fn run(&self, command: &str, phases: &[Phase]) -> RunSummary {
        let mut summary = RunSummary::begin(command, self.config.dry_run);
        let span = info_span!("run", run_id = %summary.run_id, command);
        async {
            for phase in phases {
                let result = self
                    .run_phase(*phase, &mut summary)
                    .instrument(info_span!("phase", phase = phase.as_str()))
                    .await
                    .with_context(|| format!("{} phase", phase.as_str()));
                if let Err(err) = result {
                    summary.record_fatal(err);
                    break;
                }
            }
        }
        .instrument(span)
        .await;
        summary.finish();
        summary
    }

    pub async fn match_assets(&self, index: &dyn AssetIndex, rules: &MatchingRules) -> RunSummary {
        let mut summary = RunSummary::begin("match-assets", self.config.dry_run);
        let span = info_span!("run", run_id = %summary.run_id, command = "match-assets");
        async {
            let tokens = match self.load_tokens().await {
                Ok(tokens) => tokens,
                Err(err) => return summary.record_fatal(err),
            };
            let options = self.config.match_options();
            match run_asset_matching(self.store, index, rules, &tokens, &options).await {
                Ok(report) => summary.record_matching(report),
                Err(err @ MatchError::Config(_)) => {
                    warn!(error = %err, "asset matching aborted");
                    summary.configuration_error = Some(err.to_string());
                }
                Err(err) => summary.record_fatal(anyhow::Error::new(err).context("asset matching")),
            }
        }
        .instrument(span)
        .await;
        summary.finish();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lexis_storage::{Snapshot, SnapshotStore};

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            batch_delay: Duration::ZERO,
            ..ReconcileConfig::default()
        }
    }

    fn token(id: &str, text: &str, section: &str, t: i64) -> Token {
        Token {
            id: id.into(),
            text: text.into(),
            gloss: None,
            category: None,
            position: Some(1),
            section_id: Some(section.into()),
            created_at: Utc.timestamp_opt(1_760_000_000 + t, 0).single().unwrap(),
            asset_locator: None,
            asset_strategy: None,
        }
    }

    fn section(id: &str) -> Section {
        Section {
            id: id.into(),
            book_id: "genesis".into(),
            chapter: 1,
            verse_number: 1,
            created_at: Utc.timestamp_opt(1_760_000_000, 0).single().unwrap(),
        }
    }

    #[test]
    fn exit_code_tracks_violations_and_failures() {
        let mut summary = RunSummary::begin("verify", false);
        assert_eq!(summary.exit_code(), 0);

        summary.record_verification(VerificationReport {
            residual_token_keys: vec!["A::s1".into()],
            ..VerificationReport::default()
        });
        assert_eq!(summary.counts.residual_duplicates, 1);
        assert_eq!(summary.exit_code(), 1);

        let config_failure = RunSummary::configuration_failure("match-assets", false, "no placeholder");
        assert_eq!(config_failure.exit_code(), 1);

        let aborted = RunSummary::aborted("reconcile", false, anyhow::anyhow!("connection refused"));
        assert_eq!(aborted.fatal_error.as_deref(), Some("connection refused"));
        assert_eq!(aborted.exit_code(), 1);
    }

    #[test]
    fn summary_serializes_counts_per_bucket() {
        let mut summary = RunSummary::begin("match-assets", false);
        summary.record_matching(MatchReport {
            examined: 3,
            resolved_by_strategy: BTreeMap::from([(1, 2), (6, 1)]),
            ..MatchReport::default()
        });
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["counts"]["tokens_resolved_by_strategy"]["1"], 2);
        assert_eq!(json["counts"]["tokens_resolved_by_strategy"]["6"], 1);
        assert!(json.get("verification").is_none());
        assert!(json["configuration_error"].is_null());
    }

    #[tokio::test]
    async fn detect_reports_without_writing() {
        let store = SnapshotStore::new(Snapshot {
            sections: vec![section("s1")],
            tokens: vec![token("a", "A", "s1", 1), token("b", "A", "s1", 2)],
        });
        let config = config();
        let summary = Reconciler::new(&store, &config)
            .run("detect", &[Phase::Detect])
            .await;
        let detect = summary.detect.unwrap();
        assert_eq!(detect.tokens.duplicate_groups, 1);
        assert_eq!(detect.tokens.groups_with_distinct_positions, Some(0));
        assert_eq!(detect.sections.duplicate_groups, 0);
        assert_eq!(store.snapshot().await.tokens.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_plans_but_leaves_store_untouched() {
        let store = SnapshotStore::new(Snapshot {
            sections: vec![section("s1")],
            tokens: vec![
                token("a", "A", "s1", 1),
                token("b", "A", "s1", 2),
                token("c", "B", "missing", 1),
            ],
        });
        let config = ReconcileConfig {
            dry_run: true,
            ..config()
        };
        let summary = Reconciler::new(&store, &config)
            .run("reconcile", &Phase::RECONCILE)
            .await;
        assert_eq!(summary.dedup.as_ref().unwrap().delete.requested, 1);
        assert_eq!(summary.orphans.as_ref().unwrap().found.total(), 1);
        assert_eq!(summary.counts.deleted, 0);
        assert_eq!(store.snapshot().await.tokens.len(), 3);
    }
}

//! Asset naming schemes, the curated matching ruleset, and the tiered fallback
//! chain that attaches pre-generated assets to tokens.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use lexis_core::{EntityKind, MatchStrategy, Token};
use lexis_storage::{AssetIndex, AssetIndexError, RecordPatch, RecordStore, RetryPolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "lexis-assets";

pub const DEFAULT_RULES_PATH: &str = "rules/matching.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("matching rules file {path} is missing or unreadable: {message}")]
    RulesUnreadable { path: PathBuf, message: String },
    #[error("parsing matching rules: {0}")]
    RulesInvalid(String),
    #[error("matching rules define no default asset")]
    MissingDefaultAsset,
    #[error("matching rules define no {0} keywords")]
    MissingKeywords(RuleStrategy),
    #[error("matching rules contain an empty pattern for {0}")]
    EmptyPattern(RuleStrategy),
    #[error("default asset {0} is not present in the asset index")]
    DefaultAssetUnavailable(String),
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("asset index unavailable: {0}")]
    Index(#[from] AssetIndexError),
}

impl MatchError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, MatchError::Config(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStrategy {
    PartialMeaning,
    GrammaticalContext,
}

impl RuleStrategy {
    pub fn match_strategy(self) -> MatchStrategy {
        match self {
            RuleStrategy::PartialMeaning => MatchStrategy::PartialMeaning,
            RuleStrategy::GrammaticalContext => MatchStrategy::GrammaticalContext,
        }
    }
}

impl std::fmt::Display for RuleStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.match_strategy().label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub pattern: String,
    pub strategy: RuleStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentHash {
    #[default]
    Md5,
    Sha256,
}

impl ContentHash {
    pub fn hex_digest(self, bytes: &[u8]) -> String {
        match self {
            ContentHash::Md5 => format!("{:x}", md5::compute(bytes)),
            ContentHash::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingScheme {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub hash: ContentHash,
}

fn default_prefix() -> String {
    "words/".to_string()
}

fn default_extensions() -> Vec<String> {
    ["svg", "png", "jpg", "webp"].map(String::from).to_vec()
}

impl Default for NamingScheme {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            extensions: default_extensions(),
            hash: ContentHash::default(),
        }
    }
}

impl NamingScheme {
    pub fn candidates(&self, stem: &str) -> Vec<String> {
        self.extensions
            .iter()
            .map(|ext| format!("{}{stem}.{}", self.prefix, ext.trim_start_matches('.')))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRules {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub default_asset: String,
    #[serde(default)]
    pub naming: NamingScheme,
    #[serde(default)]
    pub rules: Vec<MatchRule>,
}

impl MatchingRules {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let rules: MatchingRules =
            serde_yaml::from_str(text).map_err(|e| ConfigError::RulesInvalid(e.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::RulesUnreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_asset.trim().is_empty() {
            return Err(ConfigError::MissingDefaultAsset);
        }
        for strategy in [RuleStrategy::PartialMeaning, RuleStrategy::GrammaticalContext] {
            let patterns = self.patterns(strategy).collect::<Vec<_>>();
            if patterns.is_empty() {
                return Err(ConfigError::MissingKeywords(strategy));
            }
            if patterns.iter().any(|p| p.trim().is_empty()) {
                return Err(ConfigError::EmptyPattern(strategy));
            }
        }
        Ok(())
    }

    pub fn patterns(&self, strategy: RuleStrategy) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(move |r| r.strategy == strategy)
            .map(|r| r.pattern.as_str())
    }
}

fn is_stripped_mark(c: char) -> bool {
    matches!(
        c,
        // points, cantillation, meteg, rafe, shin/sin dots, qamats qatan
        '\u{0591}'..='\u{05BD}'
            | '\u{05BF}'
            | '\u{05C1}'..='\u{05C2}'
            | '\u{05C4}'..='\u{05C5}'
            | '\u{05C7}'
            // paseq, sof pasuq, nun hafukha
            | '\u{05C0}'
            | '\u{05C3}'
            | '\u{05C6}'
            // zero-width, bidi and other format characters
            | '\u{034F}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{2069}'
            | '\u{FEFF}'
    )
}

/// Strip diacritics and formatting marks, turn maqaf into a word break, and
/// collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !is_stripped_mark(*c))
        .map(|c| if c == '\u{05BE}' { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn content_hash_stem(text: &str, hash: ContentHash) -> String {
    hash.hex_digest(normalize_text(text).as_bytes())
}

pub fn legacy_stem(text: &str) -> String {
    normalize_text(text)
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct AssetCatalog {
    filenames: BTreeSet<String>,
    default_locator: String,
}

impl AssetCatalog {
    pub async fn load(
        index: &dyn AssetIndex,
        rules: &MatchingRules,
        retry: RetryPolicy,
    ) -> Result<Self, MatchError> {
        let prefix = rules.naming.prefix.as_str();
        let filenames = retry
            .run("list_assets", || index.list_assets(prefix))
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>();

        let default_filename = rules.default_asset.trim().to_string();
        if !filenames.contains(&default_filename)
            && !retry
                .run("asset_exists", || index.exists(&default_filename))
                .await?
        {
            return Err(ConfigError::DefaultAssetUnavailable(default_filename).into());
        }

        let default_locator = match retry
            .run("resolve_locator", || index.resolve_locator(&default_filename))
            .await
        {
            Ok(locator) => locator,
            Err(AssetIndexError::NotFound(_)) => {
                return Err(ConfigError::DefaultAssetUnavailable(default_filename.clone()).into())
            }
            Err(err) => return Err(err.into()),
        };

        info!(assets = filenames.len(), prefix, "asset catalog loaded");
        Ok(Self {
            filenames,
            default_locator,
        })
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.filenames.contains(filename)
    }
}

#[derive(Debug, Clone)]
struct Donor {
    id: String,
    gloss: String,
    category: String,
    locator: String,
}

impl Donor {
    fn from_token(token: &Token, locator: String) -> Self {
        Self {
            id: token.id.clone(),
            gloss: token.gloss.as_deref().unwrap_or_default().to_lowercase(),
            category: token.category.as_deref().unwrap_or_default().to_lowercase(),
            locator,
        }
    }
}

/// Tokens whose asset may be borrowed. Approximate results never become donors.
#[derive(Debug, Clone, Default)]
pub struct DonorPool {
    donors: Vec<Donor>,
}

impl DonorPool {
    pub fn from_tokens<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Self {
        let donors = tokens
            .into_iter()
            .filter(|t| t.has_asset())
            .filter(|t| !t.asset_strategy.is_some_and(MatchStrategy::is_approximate))
            .filter_map(|t| {
                t.asset_locator
                    .clone()
                    .map(|locator| Donor::from_token(t, locator))
            })
            .collect();
        Self { donors }
    }

    pub fn len(&self) -> usize {
        self.donors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.donors.is_empty()
    }

    fn add(&mut self, token: &Token, locator: String) {
        self.donors.push(Donor::from_token(token, locator));
    }

    /// Best donor sharing `pattern` in the chosen field: highest gloss
    /// similarity, then smallest id.
    fn best(
        &self,
        token: &Token,
        pattern: &str,
        field: impl Fn(&Donor) -> &str,
    ) -> Option<&Donor> {
        let gloss = token.gloss.as_deref().unwrap_or_default().to_lowercase();
        self.donors
            .iter()
            .filter(|d| d.id != token.id && field(d).contains(pattern))
            .map(|d| (jaro_winkler(&gloss, &d.gloss), d))
            .max_by(|(sa, a), (sb, b)| {
                sa.partial_cmp(sb)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(_, d)| d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenOutcome {
    pub token_id: String,
    pub strategy: MatchStrategy,
    pub locator: String,
    pub donor_id: Option<String>,
    pub matched_pattern: Option<String>,
}

pub struct AssetMatcher<'a> {
    index: &'a dyn AssetIndex,
    rules: &'a MatchingRules,
    catalog: &'a AssetCatalog,
    donors: DonorPool,
    retry: RetryPolicy,
}

impl<'a> AssetMatcher<'a> {
    pub fn new(
        index: &'a dyn AssetIndex,
        rules: &'a MatchingRules,
        catalog: &'a AssetCatalog,
        donors: DonorPool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            index,
            rules,
            catalog,
            donors,
            retry,
        }
    }

    fn deterministic_stem(&self, strategy: MatchStrategy, token: &Token) -> Option<String> {
        match strategy {
            MatchStrategy::ExactId => Some(token.id.clone()),
            MatchStrategy::ContentHash => (!normalize_text(&token.text).is_empty())
                .then(|| content_hash_stem(&token.text, self.rules.naming.hash)),
            MatchStrategy::LegacyName => {
                let stem = legacy_stem(&token.text);
                (!stem.is_empty()).then_some(stem)
            }
            _ => None,
        }
    }

    async fn try_deterministic(
        &self,
        strategy: MatchStrategy,
        token: &Token,
    ) -> Result<Option<String>, AssetIndexError> {
        let Some(stem) = self.deterministic_stem(strategy, token) else {
            return Ok(None);
        };
        for filename in self.rules.naming.candidates(&stem) {
            if !self.catalog.contains(&filename) {
                continue;
            }
            match self
                .retry
                .run("resolve_locator", || self.index.resolve_locator(&filename))
                .await
            {
                Ok(locator) => return Ok(Some(locator)),
                Err(AssetIndexError::NotFound(_)) => {
                    warn!(token_id = %token.id, filename, "listed asset vanished before resolve");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn try_borrow(&self, rule: RuleStrategy, token: &Token) -> Option<(&Donor, String)> {
        let own = match rule {
            RuleStrategy::PartialMeaning => token.gloss.as_deref(),
            RuleStrategy::GrammaticalContext => token.category.as_deref(),
        }?
        .to_lowercase();

        self.rules.patterns(rule).find_map(|pattern| {
            let pattern = pattern.to_lowercase();
            if !own.contains(&pattern) {
                return None;
            }
            let donor = match rule {
                RuleStrategy::PartialMeaning => self.donors.best(token, &pattern, |d| d.gloss.as_str()),
                RuleStrategy::GrammaticalContext => {
                    self.donors.best(token, &pattern, |d| d.category.as_str())
                }
            }?;
            Some((donor, pattern))
        })
    }

    /// Walk strategies 1..6 in order and stop at the first hit. Only index
    /// failures surface as errors; the placeholder guarantees a resolution.
    pub async fn resolve(&mut self, token: &Token) -> Result<TokenOutcome, AssetIndexError> {
        for strategy in [
            MatchStrategy::ExactId,
            MatchStrategy::ContentHash,
            MatchStrategy::LegacyName,
        ] {
            if let Some(locator) = self.try_deterministic(strategy, token).await? {
                self.donors.add(token, locator.clone());
                return Ok(TokenOutcome {
                    token_id: token.id.clone(),
                    strategy,
                    locator,
                    donor_id: None,
                    matched_pattern: None,
                });
            }
        }

        for rule in [RuleStrategy::PartialMeaning, RuleStrategy::GrammaticalContext] {
            if let Some((donor, pattern)) = self.try_borrow(rule, token) {
                return Ok(TokenOutcome {
                    token_id: token.id.clone(),
                    strategy: rule.match_strategy(),
                    locator: donor.locator.clone(),
                    donor_id: Some(donor.id.clone()),
                    matched_pattern: Some(pattern),
                });
            }
        }

        Ok(TokenOutcome {
            token_id: token.id.clone(),
            strategy: MatchStrategy::DefaultAsset,
            locator: self.catalog.default_locator.clone(),
            donor_id: None,
            matched_pattern: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub segment_size: usize,
    pub segment_delay: Duration,
    pub retry: RetryPolicy,
    pub dry_run: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            segment_size: 100,
            segment_delay: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFailure {
    pub failed_token_id: String,
    pub skipped_token_ids: Vec<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub examined: usize,
    pub resolved_by_strategy: BTreeMap<u8, usize>,
    pub update_failures: Vec<String>,
    pub segment_failures: Vec<SegmentFailure>,
    /// Outcomes from strategies 4-6, kept for later correction.
    pub approximate: Vec<TokenOutcome>,
    pub dry_run: bool,
}

impl MatchReport {
    pub fn resolved(&self) -> usize {
        self.resolved_by_strategy.values().sum()
    }

    pub fn unresolved(&self) -> usize {
        self.update_failures.len()
            + self
                .segment_failures
                .iter()
                .map(|f| 1 + f.skipped_token_ids.len())
                .sum::<usize>()
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved() == 0
    }
}

/// An index failure aborts the rest of its segment and is reported.
pub async fn run_asset_matching(
    store: &dyn RecordStore,
    index: &dyn AssetIndex,
    rules: &MatchingRules,
    snapshot: &[Token],
    options: &MatchOptions,
) -> Result<MatchReport, MatchError> {
    rules.validate()?;
    let catalog = AssetCatalog::load(index, rules, options.retry).await?;
    let donors = DonorPool::from_tokens(snapshot);
    debug!(donors = donors.len(), "donor pool built");

    let mut pending = snapshot.iter().filter(|t| !t.has_asset()).collect::<Vec<_>>();
    pending.sort_by(|a, b| a.id.cmp(&b.id));

    let mut matcher = AssetMatcher::new(index, rules, &catalog, donors, options.retry);
    let mut report = MatchReport {
        examined: pending.len(),
        dry_run: options.dry_run,
        ..MatchReport::default()
    };

    let segment_size = options.segment_size.max(1);
    for (segment_no, segment) in pending.chunks(segment_size).enumerate() {
        if segment_no > 0 && !options.segment_delay.is_zero() {
            tokio::time::sleep(options.segment_delay).await;
        }
        let span = info_span!("match_segment", segment_no, tokens = segment.len());
        match_segment(store, &mut matcher, segment, options.dry_run, &mut report)
            .instrument(span)
            .await;
    }

    info!(
        examined = report.examined,
        resolved = report.resolved(),
        update_failures = report.update_failures.len(),
        segment_failures = report.segment_failures.len(),
        "asset matching finished"
    );
    Ok(report)
}

async fn match_segment(
    store: &dyn RecordStore,
    matcher: &mut AssetMatcher<'_>,
    segment: &[&Token],
    dry_run: bool,
    report: &mut MatchReport,
) {
    for (i, token) in segment.iter().enumerate() {
        let outcome = match matcher.resolve(token).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(token_id = %token.id, error = %err, "asset index failure; aborting segment");
                report.segment_failures.push(SegmentFailure {
                    failed_token_id: token.id.clone(),
                    skipped_token_ids: segment[i + 1..].iter().map(|t| t.id.clone()).collect(),
                    error: err.to_string(),
                });
                return;
            }
        };

        let strategy = outcome.strategy;
        if !dry_run {
            let patch = RecordPatch::Asset {
                locator: outcome.locator.clone(),
                strategy,
            };
            if let Err(err) = store.update(EntityKind::Token, &token.id, &patch).await {
                warn!(token_id = %token.id, error = %err, "asset update failed");
                report.update_failures.push(token.id.clone());
                continue;
            }
        }

        info!(
            token_id = %token.id,
            strategy = strategy.number(),
            label = strategy.label(),
            locator = %outcome.locator,
            donor_id = outcome.donor_id.as_deref().unwrap_or(""),
            "asset attached"
        );
        *report
            .resolved_by_strategy
            .entry(strategy.number())
            .or_default() += 1;
        if strategy.is_approximate() {
            report.approximate.push(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lexis_storage::{MemoryAssetIndex, Snapshot, SnapshotStore};

    const RULES_YAML: &str = r#"
version: 1
default_asset: "placeholder.svg"
naming:
  prefix: "words/"
  extensions: ["svg", "jpg"]
rules:
  - pattern: "for the sake of"
    strategy: partial_meaning
  - pattern: "in order to"
    strategy: partial_meaning
  - pattern: "preposition"
    strategy: grammatical_context
  - pattern: "particle"
    strategy: grammatical_context
"#;

    fn rules() -> MatchingRules {
        MatchingRules::from_yaml_str(RULES_YAML).expect("rules")
    }

    fn token(id: &str, text: &str, gloss: &str, category: &str, asset: Option<&str>) -> Token {
        Token {
            id: id.into(),
            text: text.into(),
            gloss: Some(gloss.into()),
            category: Some(category.into()),
            position: Some(1),
            section_id: Some("s1".into()),
            created_at: Utc::now(),
            asset_locator: asset.map(str::to_string),
            asset_strategy: None,
        }
    }

    fn no_wait() -> MatchOptions {
        MatchOptions {
            segment_size: 10,
            segment_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            dry_run: false,
        }
    }

    #[test]
    fn normalization_strips_points_cantillation_and_format_marks() {
        // bereshit with points, a tipcha and a trailing RLM
        let pointed = "\u{05D1}\u{05B0}\u{05BC}\u{05E8}\u{05B5}\u{05D0}\u{05E9}\u{05C1}\u{05B4}\u{0596}\u{05D9}\u{05EA}\u{200F}";
        let bare = "\u{05D1}\u{05E8}\u{05D0}\u{05E9}\u{05D9}\u{05EA}";
        assert_eq!(normalize_text(pointed), bare);
        // al-pnei joined by a maqaf
        let joined = "  \u{05E2}\u{05B7}\u{05DC}\u{05BE}\u{05E4}\u{05B0}\u{05BC}\u{05E0}\u{05B5}\u{05D9}  ";
        assert_eq!(normalize_text(joined), "\u{05E2}\u{05DC} \u{05E4}\u{05E0}\u{05D9}");
        assert_eq!(legacy_stem(joined), "\u{05E2}\u{05DC}_\u{05E4}\u{05E0}\u{05D9}");
        assert_eq!(
            content_hash_stem(pointed, ContentHash::Md5),
            content_hash_stem(bare, ContentHash::Md5)
        );
    }

    #[test]
    fn content_hash_stems_default_to_md5() {
        assert_eq!(rules().naming.hash, ContentHash::Md5);
        assert_eq!(
            content_hash_stem("abc", ContentHash::Md5),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            content_hash_stem(MAYIM, ContentHash::Md5),
            "1dd7a2c3658f5e4af924b4d911366504"
        );
        assert_eq!(
            content_hash_stem("abc", ContentHash::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let sha = MatchingRules::from_yaml_str(&RULES_YAML.replace(
            "extensions: [\"svg\", \"jpg\"]",
            "extensions: [\"svg\", \"jpg\"]\n  hash: sha256",
        ))
        .expect("rules");
        assert_eq!(sha.naming.hash, ContentHash::Sha256);
    }

    #[test]
    fn rules_require_default_asset_and_both_keyword_lists() {
        assert!(matches!(
            MatchingRules::from_yaml_str("version: 1\nrules: []\n"),
            Err(ConfigError::MissingDefaultAsset)
        ));
        let no_grammar = r#"
default_asset: placeholder.svg
rules:
  - pattern: "for the sake of"
    strategy: partial_meaning
"#;
        assert!(matches!(
            MatchingRules::from_yaml_str(no_grammar),
            Err(ConfigError::MissingKeywords(RuleStrategy::GrammaticalContext))
        ));
        assert!(matches!(
            MatchingRules::from_path("/nope/matching.yaml"),
            Err(ConfigError::RulesUnreadable { .. })
        ));
        let parsed = rules();
        assert_eq!(
            parsed.patterns(RuleStrategy::PartialMeaning).collect::<Vec<_>>(),
            vec!["for the sake of", "in order to"]
        );
        assert_eq!(
            parsed.naming.candidates("abc"),
            vec!["words/abc.svg", "words/abc.jpg"]
        );
    }

    #[test]
    fn shipped_ruleset_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/matching.yaml");
        let parsed = MatchingRules::from_path(path).expect("shipped rules");
        assert!(!parsed.default_asset.is_empty());
    }

    #[tokio::test]
    async fn exact_id_beats_partial_meaning() {
        let index = MemoryAssetIndex::new("https://cdn/")
            .with_assets(["words/t1.svg", "words/donor.jpg", "placeholder.svg"]);
        let tokens = vec![
            token("t1", "למען", "for the sake of", "preposition", None),
            token("t2", "שלום", "for the sake of peace", "noun", Some("https://cdn/words/donor.jpg")),
        ];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &no_wait())
            .await
            .expect("run");
        assert_eq!(report.resolved_by_strategy.get(&1), Some(&1));
        assert!(report.approximate.is_empty());
        let t1 = store.token("t1").await.unwrap();
        assert_eq!(t1.asset_locator.as_deref(), Some("https://cdn/words/t1.svg"));
        assert_eq!(t1.asset_strategy, Some(MatchStrategy::ExactId));
    }

    #[tokio::test]
    async fn partial_meaning_borrows_donor_asset() {
        let index = MemoryAssetIndex::new("").with_assets(["X.jpg", "placeholder.svg"]);
        let tokens = vec![
            token("a", "למען", "for the sake of", "preposition", None),
            token("b", "שלום", "for the sake of peace", "noun", Some("X.jpg")),
        ];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &no_wait())
            .await
            .expect("run");
        assert_eq!(report.resolved_by_strategy.get(&4), Some(&1));
        assert_eq!(report.approximate[0].donor_id.as_deref(), Some("b"));
        assert_eq!(
            report.approximate[0].matched_pattern.as_deref(),
            Some("for the sake of")
        );
        let a = store.token("a").await.unwrap();
        assert_eq!(a.asset_locator.as_deref(), Some("X.jpg"));
        assert_eq!(a.asset_strategy, Some(MatchStrategy::PartialMeaning));
    }

    #[tokio::test]
    async fn grammatical_context_then_placeholder_complete_the_chain() {
        let index = MemoryAssetIndex::new("/assets/").with_assets(["placeholder.svg"]);
        let mut tokens = vec![
            token("p1", "אל", "to", "preposition", Some("/assets/words/el.svg")),
            token("p2", "על", "upon", "Preposition (inseparable)", None),
            token("n1", "סוס", "horse", "noun", None),
            // borrowed assets are never lent again
            token("p3", "את", "with", "noun", Some("/assets/other.svg")),
        ];
        tokens[3].asset_strategy = Some(MatchStrategy::GrammaticalContext);
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &no_wait())
            .await
            .expect("run");
        assert_eq!(report.examined, 2);
        assert_eq!(report.resolved_by_strategy.get(&5), Some(&1));
        assert_eq!(report.resolved_by_strategy.get(&6), Some(&1));
        assert!(report.is_complete());

        let snapshot = store.snapshot().await;
        assert!(snapshot.tokens.iter().all(|t| t.has_asset()));
        let n1 = store.token("n1").await.unwrap();
        assert_eq!(n1.asset_locator.as_deref(), Some("/assets/placeholder.svg"));
        assert_eq!(n1.asset_strategy, Some(MatchStrategy::DefaultAsset));
    }

    // mayim with patah and hiriq
    const MAYIM: &str = "\u{05DE}\u{05B7}\u{05D9}\u{05B4}\u{05DD}";

    #[tokio::test]
    async fn content_hash_and_legacy_names_resolve_in_order() {
        let hashed = "words/1dd7a2c3658f5e4af924b4d911366504.svg";
        let index = MemoryAssetIndex::new("").with_assets([
            hashed,
            "words/\u{05DE}\u{05D9}\u{05DD}.jpg",
            "words/\u{05D0}\u{05D5}\u{05E8}.svg",
            "placeholder.svg",
        ]);
        let tokens = vec![
            token("w1", MAYIM, "water", "noun", None),
            // or with a holam
            token("w2", "\u{05D0}\u{05D5}\u{05B9}\u{05E8}", "light", "noun", None),
        ];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &no_wait())
            .await
            .expect("run");
        assert_eq!(report.resolved_by_strategy.get(&2), Some(&1));
        assert_eq!(report.resolved_by_strategy.get(&3), Some(&1));
        assert_eq!(
            store.token("w1").await.unwrap().asset_locator.as_deref(),
            Some(hashed)
        );
        assert_eq!(
            store.token("w2").await.unwrap().asset_locator.as_deref(),
            Some("words/\u{05D0}\u{05D5}\u{05E8}.svg")
        );
    }

    #[tokio::test]
    async fn missing_placeholder_is_fatal_before_any_update() {
        let index = MemoryAssetIndex::new("").with_assets(["words/t1.svg"]);
        let tokens = vec![token("t1", "למען", "for the sake of", "preposition", None)];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });

        let err = run_asset_matching(&store, &index, &rules(), &tokens, &no_wait())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(!store.token("t1").await.unwrap().has_asset());
    }

    struct RecordingIndex {
        inner: MemoryAssetIndex,
        listed: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AssetIndex for RecordingIndex {
        async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError> {
            self.listed.lock().unwrap().push(prefix.to_string());
            self.inner.list_assets(prefix).await
        }

        async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError> {
            self.inner.resolve_locator(filename).await
        }

        async fn exists(&self, filename: &str) -> Result<bool, AssetIndexError> {
            self.inner.exists(filename).await
        }
    }

    #[tokio::test]
    async fn placeholder_outside_prefix_is_checked_without_a_second_listing() {
        let index = RecordingIndex {
            inner: MemoryAssetIndex::new("/assets/").with_assets(["words/a.svg", "placeholder.svg"]),
            listed: Default::default(),
        };
        let catalog = AssetCatalog::load(&index, &rules(), no_wait().retry)
            .await
            .expect("catalog");
        assert_eq!(*index.listed.lock().unwrap(), vec!["words/"]);
        assert!(catalog.contains("words/a.svg"));
        assert_eq!(catalog.default_locator, "/assets/placeholder.svg");

        let empty = RecordingIndex {
            inner: MemoryAssetIndex::new("").with_assets(["words/a.svg"]),
            listed: Default::default(),
        };
        let err = AssetCatalog::load(&empty, &rules(), no_wait().retry)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Config(ConfigError::DefaultAssetUnavailable(ref name)) if name == "placeholder.svg"
        ));
        assert_eq!(*empty.listed.lock().unwrap(), vec!["words/"]);
    }

    #[tokio::test]
    async fn dry_run_reports_without_updating() {
        let index = MemoryAssetIndex::new("").with_assets(["placeholder.svg"]);
        let tokens = vec![token("t1", "סוס", "horse", "noun", None)];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });
        let options = MatchOptions {
            dry_run: true,
            ..no_wait()
        };

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &options)
            .await
            .expect("run");
        assert_eq!(report.resolved_by_strategy.get(&6), Some(&1));
        assert!(!store.token("t1").await.unwrap().has_asset());
    }

    struct FlakyIndex {
        inner: MemoryAssetIndex,
        failing: &'static str,
    }

    #[async_trait::async_trait]
    impl AssetIndex for FlakyIndex {
        async fn list_assets(&self, prefix: &str) -> Result<Vec<String>, AssetIndexError> {
            self.inner.list_assets(prefix).await
        }

        async fn resolve_locator(&self, filename: &str) -> Result<String, AssetIndexError> {
            if filename == self.failing {
                return Err(AssetIndexError::Transient("connection reset".into()));
            }
            self.inner.resolve_locator(filename).await
        }
    }

    #[tokio::test]
    async fn transient_index_failure_aborts_segment_instead_of_falling_back() {
        let index = FlakyIndex {
            inner: MemoryAssetIndex::new("")
                .with_assets(["words/a.svg", "words/b.svg", "words/c.svg", "placeholder.svg"]),
            failing: "words/b.svg",
        };
        let tokens = vec![
            token("a", "א", "a", "noun", None),
            token("b", "ב", "b", "noun", None),
            token("c", "ג", "c", "noun", None),
            token("d", "ד", "d", "noun", None),
        ];
        let store = SnapshotStore::new(Snapshot {
            sections: vec![],
            tokens: tokens.clone(),
        });
        let options = MatchOptions {
            segment_size: 3,
            ..no_wait()
        };

        let report = run_asset_matching(&store, &index, &rules(), &tokens, &options)
            .await
            .expect("run");
        assert_eq!(report.segment_failures.len(), 1);
        assert_eq!(report.segment_failures[0].failed_token_id, "b");
        assert_eq!(report.segment_failures[0].skipped_token_ids, vec!["c"]);
        assert_eq!(report.unresolved(), 2);
        // the failed token never fell through to the placeholder
        assert!(!store.token("b").await.unwrap().has_asset());
        assert!(store.token("a").await.unwrap().has_asset());
        // next segment still ran
        assert!(store.token("d").await.unwrap().has_asset());
    }
}

//! Core domain model for the Lexis content store: sections, tokens, natural keys
//! and asset match strategies.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lexis-core";

pub const KEY_SEPARATOR: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Section,
    Token,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Section => "section",
            EntityKind::Token => "token",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub book_id: String,
    pub chapter: i32,
    pub verse_number: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub gloss: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub section_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub asset_locator: Option<String>,
    #[serde(default)]
    pub asset_strategy: Option<MatchStrategy>,
}

impl Token {
    pub fn has_asset(&self) -> bool {
        self.asset_locator
            .as_deref()
            .is_some_and(|locator| !locator.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    #[default]
    TextSection,
    TextSectionPosition,
}

pub trait NaturalKeyed {
    fn record_id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    /// `None` excludes the record from grouping.
    fn natural_key(&self, mode: KeyMode) -> Option<String>;
}

impl NaturalKeyed for Section {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn natural_key(&self, _mode: KeyMode) -> Option<String> {
        Some(format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.book_id, self.chapter, self.verse_number
        ))
    }
}

impl NaturalKeyed for Token {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn natural_key(&self, mode: KeyMode) -> Option<String> {
        let section_id = self.section_id.as_deref()?;
        let mut key = format!("{}{KEY_SEPARATOR}{section_id}", self.text);
        if mode == KeyMode::TextSectionPosition {
            key.push_str(KEY_SEPARATOR);
            if let Some(position) = self.position {
                key.push_str(&position.to_string());
            }
        }
        Some(key)
    }
}

/// Asset match strategies in priority order. The numeric value is what gets
/// persisted next to the locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MatchStrategy {
    ExactId = 1,
    ContentHash = 2,
    LegacyName = 3,
    PartialMeaning = 4,
    GrammaticalContext = 5,
    DefaultAsset = 6,
}

impl MatchStrategy {
    pub const ALL: [MatchStrategy; 6] = [
        MatchStrategy::ExactId,
        MatchStrategy::ContentHash,
        MatchStrategy::LegacyName,
        MatchStrategy::PartialMeaning,
        MatchStrategy::GrammaticalContext,
        MatchStrategy::DefaultAsset,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.number() == number)
    }

    /// Strategies 4-6 borrow or substitute an asset instead of matching it.
    pub fn is_approximate(self) -> bool {
        self.number() >= MatchStrategy::PartialMeaning.number()
    }

    pub fn label(self) -> &'static str {
        match self {
            MatchStrategy::ExactId => "exact_id",
            MatchStrategy::ContentHash => "content_hash",
            MatchStrategy::LegacyName => "legacy_name",
            MatchStrategy::PartialMeaning => "partial_meaning",
            MatchStrategy::GrammaticalContext => "grammatical_context",
            MatchStrategy::DefaultAsset => "default_asset",
        }
    }
}

impl From<MatchStrategy> for u8 {
    fn from(value: MatchStrategy) -> Self {
        value.number()
    }
}

impl TryFrom<u8> for MatchStrategy {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_number(value).ok_or_else(|| format!("unknown match strategy {value}"))
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

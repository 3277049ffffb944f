use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexis_core::{EntityKind, MatchStrategy, Section, Token};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::{Page, PageRequest, RecordPatch, RecordStore, StoreError, DEFAULT_MAX_PAGE_SIZE};

// Keyset pages on id::text stay valid while rows are deleted between calls.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    max_page_size: usize,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // Phases run sequentially; a second connection only covers reconnects.
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to record store")?;
        Ok(Self::new(pool))
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    fn table(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Section => "sections",
            EntityKind::Token => "tokens",
        }
    }
}

fn next_page_token<T>(records: &[T], limit: usize, id_of: impl Fn(&T) -> &str) -> Option<String> {
    if records.len() < limit {
        return None;
    }
    records.last().map(|r| id_of(r).to_string())
}

fn section_from_row(row: &PgRow) -> Result<Section, sqlx::Error> {
    Ok(Section {
        id: row.try_get("id")?,
        book_id: row.try_get("book_id")?,
        chapter: row.try_get("chapter")?,
        verse_number: row.try_get("verse_number")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<Token, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let raw_strategy: Option<i16> = row.try_get("asset_strategy")?;
    let asset_strategy = raw_strategy.and_then(|n| {
        let parsed = u8::try_from(n).ok().and_then(MatchStrategy::from_number);
        if parsed.is_none() {
            warn!(token_id = %id, asset_strategy = n, "ignoring unknown asset strategy");
        }
        parsed
    });
    Ok(Token {
        id,
        text: row.try_get("text")?,
        gloss: row.try_get("gloss")?,
        category: row.try_get("category")?,
        position: row.try_get("position")?,
        section_id: row.try_get("section_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        asset_locator: row.try_get("asset_locator")?,
        asset_strategy,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    async fn list_sections(&self, page: PageRequest) -> Result<Page<Section>, StoreError> {
        let limit = page.limit.clamp(1, self.max_page_size);
        let rows = sqlx::query(
            r#"
            SELECT id::text AS id, book_id, chapter, verse_number, created_at
              FROM sections
             WHERE ($1::text IS NULL OR id::text > $1::text)
             ORDER BY id::text
             LIMIT $2
            "#,
        )
        .bind(page.page_token)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("list_sections", e))?;

        let records = rows
            .iter()
            .map(section_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::from_sqlx("list_sections", e))?;
        let next_page_token = next_page_token(&records, limit, |s| s.id.as_str());
        Ok(Page {
            records,
            next_page_token,
        })
    }

    async fn list_tokens(&self, page: PageRequest) -> Result<Page<Token>, StoreError> {
        let limit = page.limit.clamp(1, self.max_page_size);
        let rows = sqlx::query(
            r#"
            SELECT id::text AS id, text, gloss, category, position,
                   section_id::text AS section_id, created_at,
                   asset_locator, asset_strategy
              FROM tokens
             WHERE ($1::text IS NULL OR id::text > $1::text)
             ORDER BY id::text
             LIMIT $2
            "#,
        )
        .bind(page.page_token)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("list_tokens", e))?;

        let records = rows
            .iter()
            .map(token_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::from_sqlx("list_tokens", e))?;
        let next_page_token = next_page_token(&records, limit, |t| t.id.as_str());
        Ok(Page {
            records,
            next_page_token,
        })
    }

    async fn delete_by_ids(&self, kind: EntityKind, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE id = ANY($1::uuid[])", Self::table(kind));
        let result = sqlx::query(&sql)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("delete_by_ids", e))?;
        Ok(result.rows_affected() as usize)
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

        let query = match patch {
            RecordPatch::SectionRef { section_id } => {
                sqlx::query("UPDATE tokens SET section_id = $2::uuid WHERE id = $1::uuid")
                    .bind(id)
                    .bind(section_id)
            }
            RecordPatch::Asset { locator, strategy } => sqlx::query(
                "UPDATE tokens SET asset_locator = $2, asset_strategy = $3 WHERE id = $1::uuid",
            )
            .bind(id)
            .bind(locator)
            .bind(i16::from(strategy.number())),
        };

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("update", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

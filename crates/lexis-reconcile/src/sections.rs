//! Merging duplicate sections without stranding their tokens.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use lexis_core::{EntityKind, KeyMode, Section, Token};
use lexis_storage::{RecordPatch, RecordStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::delete::{BatchDeleter, DeleteOutcome};
use crate::detect::{detect_duplicates, plan_deletions, CanonicalDecision};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relink {
    pub token_id: String,
    pub from_section: String,
    pub to_section: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SectionMergePlan {
    pub decisions: Vec<CanonicalDecision>,
    pub relinks: Vec<Relink>,
}

impl SectionMergePlan {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

pub fn plan_section_merge(sections: &[Section], tokens: &[Token]) -> SectionMergePlan {
    let detection = detect_duplicates(sections.iter().cloned(), KeyMode::default());
    let decisions = plan_deletions(&detection);

    let canonical_for = decisions
        .iter()
        .flat_map(|d| d.delete_ids.iter().map(move |id| (id.as_str(), d.keep_id.as_str())))
        .collect::<HashMap<_, _>>();

    let mut relinks = tokens
        .iter()
        .filter_map(|token| {
            let from = token.section_id.as_deref()?;
            let to = canonical_for.get(from)?;
            Some(Relink {
                token_id: token.id.clone(),
                from_section: from.to_string(),
                to_section: (*to).to_string(),
            })
        })
        .collect::<Vec<_>>();
    relinks.sort_by(|a, b| a.token_id.cmp(&b.token_id));

    SectionMergePlan { decisions, relinks }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SectionReport {
    pub duplicate_groups: usize,
    pub tokens_relinked: usize,
    pub relink_failures: Vec<String>,
    /// Non-canonical sections kept because one of their tokens could not be moved.
    pub held_back: Vec<String>,
    pub delete: DeleteOutcome,
}

impl SectionReport {
    pub fn failed_ids(&self) -> impl Iterator<Item = &String> {
        self.held_back.iter().chain(&self.delete.failed_ids)
    }
}

/// Relink tokens to their canonical section, then delete the sections that were
/// fully emptied. Relink updates are paced like delete batches.
pub async fn apply_section_merge(
    store: &dyn RecordStore,
    plan: &SectionMergePlan,
    deleter: &BatchDeleter,
) -> SectionReport {
    let mut report = SectionReport {
        duplicate_groups: plan.decisions.len(),
        ..SectionReport::default()
    };
    let mut blocked = BTreeSet::new();

    if deleter.dry_run {
        info!(planned = plan.relinks.len(), "dry run; skipping relinks");
    } else {
        relink_tokens(
            store,
            &plan.relinks,
            deleter.batch_size,
            deleter.batch_delay,
            &mut report,
            &mut blocked,
        )
        .await;
    }

    let mut deletable = Vec::new();
    for id in plan.decisions.iter().flat_map(|d| &d.delete_ids) {
        if blocked.contains(id.as_str()) {
            report.held_back.push(id.clone());
        } else {
            deletable.push(id.clone());
        }
    }
    if !report.held_back.is_empty() {
        warn!(sections = report.held_back.len(), "keeping sections with unmoved tokens");
    }

    report.delete = deleter.delete(store, EntityKind::Section, &deletable).await;
    report
}

async fn relink_tokens(
    store: &dyn RecordStore,
    relinks: &[Relink],
    batch_size: usize,
    batch_delay: Duration,
    report: &mut SectionReport,
    blocked: &mut BTreeSet<String>,
) {
    for (batch_no, batch) in relinks.chunks(batch_size.max(1)).enumerate() {
        if batch_no > 0 && !batch_delay.is_zero() {
            tokio::time::sleep(batch_delay).await;
        }
        for relink in batch {
            let patch = RecordPatch::SectionRef {
                section_id: relink.to_section.clone(),
            };
            match store.update(EntityKind::Token, &relink.token_id, &patch).await {
                Ok(()) => report.tokens_relinked += 1,
                // deleted since the snapshot; nothing left to strand
                Err(StoreError::NotFound { .. }) => {
                    debug!(token_id = %relink.token_id, "token vanished before relink");
                }
                Err(err) => {
                    warn!(
                        token_id = %relink.token_id,
                        from = %relink.from_section,
                        to = %relink.to_section,
                        error = %err,
                        "relink failed"
                    );
                    report.relink_failures.push(relink.token_id.clone());
                    blocked.insert(relink.from_section.clone());
                }
            }
        }
    }
    info!(
        relinked = report.tokens_relinked,
        failures = report.relink_failures.len(),
        "relink phase finished"
    );
}

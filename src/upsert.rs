//! Idempotent persistence of canonical records.
//!
//! A batch is written in one store transaction. Records whose fingerprint
//! matches the stored one are not written. After the batch commits, the
//! downstream hook fires once per inserted or changed record. Transient
//! storage failures are retried with the engine's [`RetryPolicy`]; what is
//! left is returned as a persistence error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::fetch::{RetryDecision, RetryPolicy};
use crate::hooks::{ChangeKind, RecordEvent, RecordHook};
use crate::models::{CanonicalRecord, UpsertOutcome};
use crate::store::{PreparedRecord, Store};

/// Outcome counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub inserted: u64,
    pub changed: u64,
    pub unchanged: u64,
}

pub struct UpsertEngine {
    store: Arc<dyn Store>,
    hook: Arc<dyn RecordHook>,
    retry: RetryPolicy,
}

fn classify_persistence(err: &IngestError) -> RetryDecision {
    if err.is_transient_persistence() {
        RetryDecision::Retry
    } else {
        RetryDecision::Stop
    }
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn Store>, hook: Arc<dyn RecordHook>, retry: RetryPolicy) -> Self {
        Self { store, hook, retry }
    }

    pub async fn apply(
        &self,
        org_id: &str,
        records: &[CanonicalRecord],
        now: DateTime<Utc>,
    ) -> Result<BatchSummary> {
        if records.is_empty() {
            return Ok(BatchSummary::default());
        }
        let batch = records
            .iter()
            .map(PreparedRecord::from_canonical)
            .collect::<Result<Vec<_>>>()?;

        let outcomes = self
            .retry
            .run(classify_persistence, |_| {
                self.store.upsert_batch(org_id, &batch, now)
            })
            .await?;

        if outcomes.len() != batch.len() {
            return Err(IngestError::persistence(
                format!(
                    "store returned {} outcomes for {} records",
                    outcomes.len(),
                    batch.len()
                ),
                false,
            ));
        }

        let mut summary = BatchSummary::default();
        for (rec, outcome) in batch.iter().zip(outcomes) {
            let change = match outcome {
                UpsertOutcome::Inserted => {
                    summary.inserted += 1;
                    ChangeKind::New
                }
                UpsertOutcome::Changed => {
                    summary.changed += 1;
                    ChangeKind::Changed
                }
                UpsertOutcome::Unchanged => {
                    summary.unchanged += 1;
                    continue;
                }
            };
            self.hook.publish(RecordEvent {
                org_id: org_id.to_string(),
                variant: rec.variant,
                natural_key: rec.natural_key.clone(),
                source_kind: rec.source_kind,
                change,
            });
        }
        debug!(
            inserted = summary.inserted,
            changed = summary.changed,
            unchanged = summary.unchanged,
            "batch committed"
        );
        Ok(summary)
    }
}

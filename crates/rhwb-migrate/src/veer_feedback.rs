//! Veer feedback migration: Supabase `veer_feedback` into the Cloud SQL table
//! of the same name. Runner ids are already canonical, no mapping step.

use std::fmt;

use anyhow::{Context, Result};
use rhwb_core::{SourceTable, VeerFeedbackRecord, VeerFeedbackRow};
use rhwb_source::{fetch_all_typed, PageSource};
use rhwb_target::TargetConnector;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{stage, upsert_and_close, MigrationConfig, Verification};

pub const COLUMNS: &[&str] = &[
    "message_id",
    "runner_id",
    "feedback",
    "user_question",
    "assistant_response",
    "comment",
    "created_at",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackPlan {
    pub records: Vec<VeerFeedbackRecord>,
    /// Rows dropped for a null, empty, or zero runner id.
    pub skipped: usize,
}

pub fn build_plan(rows: Vec<VeerFeedbackRow>) -> FeedbackPlan {
    let mut plan = FeedbackPlan::default();
    for row in rows {
        match VeerFeedbackRecord::from_row(row) {
            Some(record) => plan.records.push(record),
            None => plan.skipped += 1,
        }
    }
    plan
}

#[derive(Debug, Clone, Serialize)]
pub struct VeerFeedbackSummary {
    pub run_id: Uuid,
    pub fetched: usize,
    pub skipped: usize,
    pub prepared: usize,
    pub upserted: usize,
    pub verification: Verification,
}

impl fmt::Display for VeerFeedbackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fetched == 0 {
            return write!(f, "No data to migrate.");
        }
        writeln!(f, "4. Verification summary:")?;
        writeln!(f, "  Supabase rows fetched:         {}", self.fetched)?;
        writeln!(f, "  Records upserted to Cloud SQL: {}", self.upserted)?;
        writeln!(f, "  Skipped (no runner_id):        {}", self.skipped)?;
        writeln!(f)?;
        write!(f, "{}", self.verification)
    }
}

pub async fn run<S, C>(
    config: &MigrationConfig,
    source: &S,
    target: &C,
) -> Result<VeerFeedbackSummary>
where
    S: PageSource + ?Sized,
    C: TargetConnector<VeerFeedbackRecord> + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("veer_feedback_migration", %run_id);
    async move {
        stage(2, "Fetching veer_feedback rows...");
        let rows: Vec<VeerFeedbackRow> = fetch_all_typed(
            source,
            SourceTable::VeerFeedback,
            COLUMNS,
            &[],
            config.page_size,
        )
        .await
        .context("fetching veer_feedback")?;
        let fetched = rows.len();
        info!("  Fetched {fetched} rows from veer_feedback");

        if fetched == 0 {
            return Ok(VeerFeedbackSummary {
                run_id,
                fetched,
                skipped: 0,
                prepared: 0,
                upserted: 0,
                verification: Verification::Matched,
            });
        }

        let plan = build_plan(rows);
        if plan.skipped > 0 {
            warn!("  WARNING: Skipped {} rows with missing runner_id", plan.skipped);
        }
        info!("  Prepared {} records for upsert", plan.records.len());

        stage(3, "Connecting to Cloud SQL and upserting...");
        let upserted = upsert_and_close(target, &plan.records, config.batch_size).await?;

        let prepared = plan.records.len();
        let verification = Verification::check(prepared, upserted);

        Ok(VeerFeedbackSummary {
            run_id,
            fetched,
            skipped: plan.skipped,
            prepared,
            upserted,
            verification,
        })
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(message_id: &str, runner_id: serde_json::Value) -> VeerFeedbackRow {
        serde_json::from_value(json!({
            "message_id": message_id,
            "runner_id": runner_id,
            "feedback": "up",
            "user_question": "How far today?",
            "assistant_response": "Easy 5k.",
            "comment": null,
            "created_at": "2024-05-01T10:00:00Z",
        }))
        .expect("feedback row")
    }

    #[test]
    fn rows_without_runner_are_skipped() {
        let plan = build_plan(vec![
            row("m1", json!("R1")),
            row("m2", json!(null)),
            row("m3", json!("")),
            row("m4", json!(0)),
            row("m5", json!(42)),
        ]);

        assert_eq!(plan.skipped, 3);
        let ids: Vec<_> = plan
            .records
            .iter()
            .map(|r| (r.message_id.as_str(), r.runner_id.as_str()))
            .collect();
        assert_eq!(ids, vec![("m1", "R1"), ("m5", "42")]);
    }

    #[test]
    fn optional_text_passes_through() {
        let plan = build_plan(vec![row("m1", json!("R1"))]);
        let record = &plan.records[0];
        assert_eq!(record.feedback.as_deref(), Some("up"));
        assert_eq!(record.comment, None);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn empty_source_summary_says_so() {
        let summary = VeerFeedbackSummary {
            run_id: Uuid::nil(),
            fetched: 0,
            skipped: 0,
            prepared: 0,
            upserted: 0,
            verification: Verification::Matched,
        };
        assert_eq!(summary.to_string(), "No data to migrate.");
    }
}

//! Qual score migration: `rhwb_coach_input` (season 14+) and legacy
//! `rhwb_meso_scores` (season 13 and earlier) into `qual_scores`.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use rhwb_core::{
    CoachInputRow, IdentifierMap, LegacyMesoScoreRow, QualScoreRecord, RunnerProfileRow,
    SourceTable, LEGACY_SEASON_MAX,
};
use rhwb_source::{fetch_all_typed, FetchError, Filter, PageSource};
use rhwb_target::TargetConnector;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{stage, upsert_and_close, MigrationConfig, Verification};

pub const PROFILE_COLUMNS: &[&str] = &["email_id", "runner_id"];
pub const COACH_INPUT_COLUMNS: &[&str] = &["email_id", "season", "meso", "meso_qual_score"];
pub const LEGACY_COLUMNS: &[&str] = &["email_id", "season", "meso", "qual"];

/// What became of one source row on its way to `qual_scores`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Mapped(QualScoreRecord),
    UnmappedIdentifier(String),
    MissingIdentifier,
    EmptyScore,
    UnparseableSeason(Option<String>),
    SeasonOutOfRange(u32),
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn map_identifier(
    email: Option<String>,
    map: &IdentifierMap,
    build: impl FnOnce(rhwb_core::RunnerId) -> QualScoreRecord,
) -> RowOutcome {
    let Some(email) = email else {
        return RowOutcome::MissingIdentifier;
    };
    match map.get(&email) {
        Some(runner_id) => RowOutcome::Mapped(build(runner_id.clone())),
        None => RowOutcome::UnmappedIdentifier(email),
    }
}

/// Coach-input rows carry no season filter; the table only holds season 14+.
pub fn normalize_coach_input(row: CoachInputRow, map: &IdentifierMap) -> RowOutcome {
    let Some(qual_score) = non_blank(row.meso_qual_score) else {
        return RowOutcome::EmptyScore;
    };
    let (season, meso) = (row.season, row.meso);
    map_identifier(row.email_id, map, |runner_id| QualScoreRecord {
        runner_id,
        season,
        meso,
        qual_score,
        source_table: SourceTable::RhwbCoachInput,
    })
}

pub fn normalize_legacy(row: LegacyMesoScoreRow, map: &IdentifierMap) -> RowOutcome {
    let Some(season) = row.season.as_ref().and_then(|s| s.number()) else {
        return RowOutcome::UnparseableSeason(row.season.map(|s| s.raw().to_string()));
    };
    if season > LEGACY_SEASON_MAX {
        return RowOutcome::SeasonOutOfRange(season);
    }
    let Some(qual_score) = non_blank(row.qual) else {
        return RowOutcome::EmptyScore;
    };
    let meso = row.meso;
    map_identifier(row.email_id, map, |runner_id| QualScoreRecord {
        runner_id,
        // bounded by LEGACY_SEASON_MAX above
        season: season as i32,
        meso,
        qual_score,
        source_table: SourceTable::RhwbMesoScores,
    })
}

/// Per-source tallies of row outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BranchCounts {
    pub fetched: usize,
    pub mapped: usize,
    pub unmapped: usize,
    pub missing_identifier: usize,
    pub empty_score: usize,
    pub unparseable_season: usize,
    pub season_out_of_range: usize,
}

impl BranchCounts {
    /// Rows that passed the source filters, mapped or not.
    pub fn eligible(&self) -> usize {
        self.mapped + self.unmapped + self.missing_identifier
    }

    fn tally(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Mapped(_) => self.mapped += 1,
            RowOutcome::UnmappedIdentifier(_) => self.unmapped += 1,
            RowOutcome::MissingIdentifier => self.missing_identifier += 1,
            RowOutcome::EmptyScore => self.empty_score += 1,
            RowOutcome::UnparseableSeason(_) => self.unparseable_season += 1,
            RowOutcome::SeasonOutOfRange(_) => self.season_out_of_range += 1,
        }
    }
}

/// Records ready for upsert plus everything that was set aside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualScorePlan {
    pub records: Vec<QualScoreRecord>,
    pub unmapped: BTreeSet<String>,
    pub coach_input: BranchCounts,
    pub legacy: BranchCounts,
}

impl QualScorePlan {
    pub fn push(&mut self, branch: SourceTable, outcome: RowOutcome) {
        let counts = match branch {
            SourceTable::RhwbMesoScores => &mut self.legacy,
            _ => &mut self.coach_input,
        };
        counts.fetched += 1;
        counts.tally(&outcome);

        match outcome {
            RowOutcome::Mapped(record) => self.records.push(record),
            RowOutcome::UnmappedIdentifier(email) => {
                self.unmapped.insert(email);
            }
            _ => {}
        }
    }
}

/// Coach-input rows first, then legacy rows, each in fetch order.
pub fn build_plan(
    coach_rows: Vec<CoachInputRow>,
    legacy_rows: Vec<LegacyMesoScoreRow>,
    map: &IdentifierMap,
) -> QualScorePlan {
    let mut plan = QualScorePlan::default();
    for row in coach_rows {
        plan.push(SourceTable::RhwbCoachInput, normalize_coach_input(row, map));
    }
    for row in legacy_rows {
        plan.push(SourceTable::RhwbMesoScores, normalize_legacy(row, map));
    }
    plan
}

pub async fn fetch_runner_id_map<S>(source: &S, page_size: usize) -> Result<IdentifierMap, FetchError>
where
    S: PageSource + ?Sized,
{
    let rows: Vec<RunnerProfileRow> = fetch_all_typed(
        source,
        SourceTable::RunnersProfile,
        PROFILE_COLUMNS,
        &[],
        page_size,
    )
    .await?;
    let map = IdentifierMap::from_profiles(rows);
    info!("  Loaded {} runner_id mappings from runners_profile", map.len());
    Ok(map)
}

pub async fn fetch_coach_input_rows<S>(
    source: &S,
    page_size: usize,
) -> Result<Vec<CoachInputRow>, FetchError>
where
    S: PageSource + ?Sized,
{
    let rows: Vec<CoachInputRow> = fetch_all_typed(
        source,
        SourceTable::RhwbCoachInput,
        COACH_INPUT_COLUMNS,
        &[Filter::not_null("meso_qual_score")],
        page_size,
    )
    .await?;
    info!("  Fetched {} rows from rhwb_coach_input", rows.len());
    Ok(rows)
}

pub async fn fetch_legacy_rows<S>(
    source: &S,
    page_size: usize,
) -> Result<Vec<LegacyMesoScoreRow>, FetchError>
where
    S: PageSource + ?Sized,
{
    let rows: Vec<LegacyMesoScoreRow> = fetch_all_typed(
        source,
        SourceTable::RhwbMesoScores,
        LEGACY_COLUMNS,
        &[Filter::eq("category", "Personal"), Filter::not_null("qual")],
        page_size,
    )
    .await?;
    info!("  Fetched {} legacy rows from rhwb_meso_scores", rows.len());
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
pub struct QualScoreSummary {
    pub run_id: Uuid,
    pub coach_input: BranchCounts,
    pub legacy: BranchCounts,
    pub prepared: usize,
    pub upserted: usize,
    pub unmapped: Vec<String>,
    pub verification: Verification,
}

impl fmt::Display for QualScoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coach = self.coach_input.eligible();
        let legacy = self.legacy.eligible();
        writeln!(f, "7. Verification summary:")?;
        writeln!(f, "  rhwb_coach_input rows fetched:  {coach}")?;
        writeln!(f, "  rhwb_meso_scores legacy fetched: {legacy}")?;
        writeln!(f, "  Total source rows:               {}", coach + legacy)?;
        writeln!(f, "  Records upserted to Cloud SQL:   {}", self.upserted)?;
        writeln!(f, "  Unmapped emails (skipped):       {}", self.unmapped.len())?;
        writeln!(f)?;
        write!(f, "{}", self.verification)
    }
}

/// Run the whole qual score migration against `source` and `target`.
pub async fn run<S, C>(config: &MigrationConfig, source: &S, target: &C) -> Result<QualScoreSummary>
where
    S: PageSource + ?Sized,
    C: TargetConnector<QualScoreRecord> + ?Sized,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("qual_score_migration", %run_id);
    run_inner(run_id, config, source, target).instrument(span).await
}

async fn run_inner<S, C>(
    run_id: Uuid,
    config: &MigrationConfig,
    source: &S,
    target: &C,
) -> Result<QualScoreSummary>
where
    S: PageSource + ?Sized,
    C: TargetConnector<QualScoreRecord> + ?Sized,
{
    stage(2, "Loading runner_id mappings...");
    let runner_map = fetch_runner_id_map(source, config.page_size)
        .await
        .context("fetching runners_profile")?;

    stage(3, "Fetching qual scores from rhwb_coach_input...");
    let coach_rows = fetch_coach_input_rows(source, config.page_size)
        .await
        .context("fetching rhwb_coach_input")?;

    stage(4, "Fetching legacy qual scores from rhwb_meso_scores...");
    let legacy_rows = fetch_legacy_rows(source, config.page_size)
        .await
        .context("fetching rhwb_meso_scores")?;

    stage(5, "Mapping email_id -> runner_id...");
    let plan = build_plan(coach_rows, legacy_rows, &runner_map);
    info!(
        coach_input = plan.coach_input.eligible(),
        legacy = plan.legacy.eligible(),
        "  Prepared {} records for upsert",
        plan.records.len()
    );
    let dropped = [&plan.coach_input, &plan.legacy]
        .iter()
        .map(|c| c.empty_score + c.unparseable_season + c.season_out_of_range)
        .sum::<usize>();
    if dropped > 0 {
        info!(
            empty_score = plan.coach_input.empty_score + plan.legacy.empty_score,
            unparseable_season = plan.legacy.unparseable_season,
            season_out_of_range = plan.legacy.season_out_of_range,
            "  Dropped {dropped} rows that failed source filters"
        );
    }
    let missing = plan.coach_input.missing_identifier + plan.legacy.missing_identifier;
    if missing > 0 {
        warn!("  WARNING: {missing} row(s) had no email_id");
    }
    if !plan.unmapped.is_empty() {
        warn!(
            "  WARNING: {} email(s) had no runner_id mapping:",
            plan.unmapped.len()
        );
        for email in &plan.unmapped {
            warn!("    - {email}");
        }
    }

    stage(6, "Connecting to Cloud SQL and upserting...");
    let upserted = upsert_and_close(target, &plan.records, config.batch_size).await?;

    let prepared = plan.records.len();
    let verification = Verification::check(prepared, upserted);

    Ok(QualScoreSummary {
        run_id,
        coach_input: plan.coach_input,
        legacy: plan.legacy,
        prepared,
        upserted,
        unmapped: plan.unmapped.into_iter().collect(),
        verification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhwb_core::{RunnerId, SeasonLabel};

    fn runner_map() -> IdentifierMap {
        IdentifierMap::from_profiles(vec![RunnerProfileRow {
            email_id: Some("a@x.com".to_string()),
            runner_id: Some(RunnerId::new("R1")),
        }])
    }

    fn coach(email: &str, score: Option<&str>) -> CoachInputRow {
        CoachInputRow {
            email_id: Some(email.to_string()),
            season: 14,
            meso: 1,
            meso_qual_score: score.map(str::to_string),
        }
    }

    fn legacy(email: &str, season: Option<&str>, qual: Option<&str>) -> LegacyMesoScoreRow {
        LegacyMesoScoreRow {
            email_id: Some(email.to_string()),
            season: season.map(SeasonLabel::new),
            meso: 2,
            qual: qual.map(str::to_string),
        }
    }

    #[test]
    fn blank_scores_are_excluded_in_both_branches() {
        let map = runner_map();
        for score in [None, Some(""), Some("   "), Some("\t\n")] {
            assert_eq!(normalize_coach_input(coach("a@x.com", score), &map), RowOutcome::EmptyScore);
            assert_eq!(
                normalize_legacy(legacy("a@x.com", Some("Season 13"), score), &map),
                RowOutcome::EmptyScore
            );
        }
    }

    #[test]
    fn legacy_seasons_parse_from_digits_and_cap_at_thirteen() {
        let map = runner_map();

        for label in ["Season 13", "S-13", "13"] {
            match normalize_legacy(legacy("a@x.com", Some(label), Some("Q0")), &map) {
                RowOutcome::Mapped(record) => {
                    assert_eq!(record.season, 13);
                    assert_eq!(record.source_table, SourceTable::RhwbMesoScores);
                }
                other => panic!("{label:?} gave {other:?}"),
            }
        }

        assert_eq!(
            normalize_legacy(legacy("a@x.com", Some("Season 14"), Some("Q0")), &map),
            RowOutcome::SeasonOutOfRange(14)
        );
        assert_eq!(
            normalize_legacy(legacy("a@x.com", Some("Preseason"), Some("Q0")), &map),
            RowOutcome::UnparseableSeason(Some("Preseason".to_string()))
        );
        assert_eq!(
            normalize_legacy(legacy("a@x.com", None, Some("Q0")), &map),
            RowOutcome::UnparseableSeason(None)
        );
    }

    #[test]
    fn coach_input_keeps_any_season() {
        let mut row = coach("a@x.com", Some("Q1"));
        row.season = 3;
        assert!(matches!(
            normalize_coach_input(row, &runner_map()),
            RowOutcome::Mapped(QualScoreRecord { season: 3, .. })
        ));
    }

    #[test]
    fn unmapped_emails_are_reported_once() {
        let plan = build_plan(
            vec![
                coach("ghost@x.com", Some("Q1")),
                coach("ghost@x.com", Some("Q2")),
                coach("a@x.com", Some("Q3")),
            ],
            vec![
                legacy("ghost@x.com", Some("Season 12"), Some("Q4")),
                legacy("other@x.com", Some("Season 12"), Some("Q5")),
            ],
            &runner_map(),
        );

        assert_eq!(plan.records.len(), 1);
        assert_eq!(
            plan.unmapped.iter().cloned().collect::<Vec<_>>(),
            vec!["ghost@x.com".to_string(), "other@x.com".to_string()]
        );
        assert_eq!(plan.coach_input.unmapped, 2);
        assert_eq!(plan.legacy.unmapped, 2);
        assert_eq!(plan.coach_input.eligible(), 3);
    }

    #[test]
    fn filtered_rows_never_count_as_unmapped() {
        let plan = build_plan(
            vec![coach("ghost@x.com", Some(" "))],
            vec![legacy("ghost@x.com", Some("Season 20"), Some("Q"))],
            &runner_map(),
        );

        assert!(plan.records.is_empty());
        assert!(plan.unmapped.is_empty());
        assert_eq!(plan.coach_input.empty_score, 1);
        assert_eq!(plan.legacy.season_out_of_range, 1);
        assert_eq!(plan.legacy.eligible(), 0);
    }

    #[test]
    fn score_text_is_stored_untrimmed() {
        match normalize_coach_input(coach("a@x.com", Some(" strong build ")), &runner_map()) {
            RowOutcome::Mapped(record) => assert_eq!(record.qual_score, " strong build "),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}

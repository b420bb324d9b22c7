//! Core domain model for the RHWB Supabase -> Cloud SQL migration.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "rhwb-core";

/// Highest season number stored in the legacy `rhwb_meso_scores` schema.
pub const LEGACY_SEASON_MAX: u32 = 13;

/// Source tables read from Supabase. The two qual-score tables double as the
/// provenance tag written to `qual_scores.source_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    RunnersProfile,
    RhwbCoachInput,
    RhwbMesoScores,
    VeerFeedback,
}

impl SourceTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunnersProfile => "runners_profile",
            Self::RhwbCoachInput => "rhwb_coach_input",
            Self::RhwbMesoScores => "rhwb_meso_scores",
            Self::VeerFeedback => "veer_feedback",
        }
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical internal runner identifier, kept as opaque text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RunnerId(String);

impl RunnerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar shapes PostgREST may hand back for a loosely typed column.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    fn is_falsy(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Int(i) => *i == 0,
            Self::Float(f) => *f == 0.0,
            Self::Bool(b) => !b,
        }
    }
}

/// Serde helpers for columns whose JSON type is not guaranteed.
pub mod de {
    use super::*;
    use serde::de::Error;

    /// Integer column that may arrive as a number or a numeric string.
    pub fn lenient_i32<'de, D>(deserializer: D) -> Result<i32, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Scalar::deserialize(deserializer)? {
            Scalar::Int(i) => i32::try_from(i).map_err(D::Error::custom),
            Scalar::Float(f) if f.fract() == 0.0 && f.abs() <= i32::MAX as f64 => Ok(f as i32),
            Scalar::Text(s) => s
                .trim()
                .parse::<i32>()
                .map_err(|err| D::Error::custom(format!("invalid integer {s:?}: {err}"))),
            other => Err(D::Error::custom(format!("expected integer, got {other:?}"))),
        }
    }

    /// Required text column; numbers and booleans are rendered as text.
    pub fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Scalar::deserialize(deserializer)?.into_text())
    }

    /// Nullable text column; numbers and booleans are rendered as text.
    pub fn lenient_text_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
    }

    /// Runner id column. Null, empty and zero values count as missing.
    pub fn runner_id_opt<'de, D>(deserializer: D) -> Result<Option<RunnerId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Scalar>::deserialize(deserializer)?
            .filter(|v| !v.is_falsy())
            .map(|v| RunnerId(v.into_text())))
    }

    /// Timestamp column, with or without a UTC offset.
    pub fn timestamp_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
            .map(|naive| Some(naive.and_utc()))
            .map_err(|err| D::Error::custom(format!("invalid timestamp {raw:?}: {err}")))
    }
}

/// Raw legacy season value, e.g. `"Season 13"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SeasonLabel(String);

impl SeasonLabel {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn raw(&self) -> &str {
        &self.0
    }

    /// Season number built from the label's digit characters only.
    /// Labels without digits yield `None`; oversized numbers saturate.
    pub fn number(&self) -> Option<u32> {
        let mut digits = self.0.chars().filter_map(|c| c.to_digit(10)).peekable();
        digits.peek()?;
        Some(digits.fold(0u32, |acc, d| acc.saturating_mul(10).saturating_add(d)))
    }
}

impl<'de> Deserialize<'de> for SeasonLabel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self(Scalar::deserialize(deserializer)?.into_text()))
    }
}

/// `runners_profile` row: external email identifier -> runner id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunnerProfileRow {
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub email_id: Option<String>,
    #[serde(default, deserialize_with = "de::runner_id_opt")]
    pub runner_id: Option<RunnerId>,
}

/// `rhwb_coach_input` row (season 14 onwards).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoachInputRow {
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub email_id: Option<String>,
    #[serde(deserialize_with = "de::lenient_i32")]
    pub season: i32,
    #[serde(deserialize_with = "de::lenient_i32")]
    pub meso: i32,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub meso_qual_score: Option<String>,
}

/// `rhwb_meso_scores` row (season 13 and earlier).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacyMesoScoreRow {
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub email_id: Option<String>,
    #[serde(default)]
    pub season: Option<SeasonLabel>,
    #[serde(deserialize_with = "de::lenient_i32")]
    pub meso: i32,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub qual: Option<String>,
}

/// `veer_feedback` row as stored in Supabase.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VeerFeedbackRow {
    #[serde(deserialize_with = "de::lenient_text")]
    pub message_id: String,
    #[serde(default, deserialize_with = "de::runner_id_opt")]
    pub runner_id: Option<RunnerId>,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub feedback: Option<String>,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub user_question: Option<String>,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub assistant_response: Option<String>,
    #[serde(default, deserialize_with = "de::lenient_text_opt")]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "de::timestamp_opt")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Read-only email -> runner id lookup built once per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentifierMap {
    by_email: HashMap<String, RunnerId>,
}

impl IdentifierMap {
    /// Later rows win for a repeated email; rows without a runner id are ignored.
    pub fn from_profiles<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = RunnerProfileRow>,
    {
        let mut by_email = HashMap::new();
        for row in rows {
            if let (Some(email), Some(runner_id)) = (row.email_id, row.runner_id) {
                by_email.insert(email, runner_id);
            }
        }
        Self { by_email }
    }

    pub fn get(&self, email: &str) -> Option<&RunnerId> {
        self.by_email.get(email)
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}

/// Target row for `qual_scores`, keyed on `(runner_id, season, meso)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualScoreRecord {
    pub runner_id: RunnerId,
    pub season: i32,
    pub meso: i32,
    pub qual_score: String,
    pub source_table: SourceTable,
}

impl QualScoreRecord {
    pub fn key(&self) -> (RunnerId, i32, i32) {
        (self.runner_id.clone(), self.season, self.meso)
    }
}

/// Target row for `veer_feedback`, keyed on `(message_id, runner_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VeerFeedbackRecord {
    pub message_id: String,
    pub runner_id: RunnerId,
    pub feedback: Option<String>,
    pub user_question: Option<String>,
    pub assistant_response: Option<String>,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl VeerFeedbackRecord {
    /// `None` when the source row carries no usable runner id.
    pub fn from_row(row: VeerFeedbackRow) -> Option<Self> {
        let runner_id = row.runner_id?;
        Some(Self {
            message_id: row.message_id,
            runner_id,
            feedback: row.feedback,
            user_question: row.user_question,
            assistant_response: row.assistant_response,
            comment: row.comment,
            created_at: row.created_at,
        })
    }

    pub fn key(&self) -> (String, RunnerId) {
        (self.message_id.clone(), self.runner_id.clone())
    }
}

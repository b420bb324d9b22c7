//! In-process [`PageSource`] serving fixture rows with PostgREST filter semantics.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::{FetchError, Filter, FilterOp, PageQuery, PageSource};

#[derive(Debug, Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<JsonValue>>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, table: impl Into<String>, rows: Vec<JsonValue>) -> Self {
        self.tables.insert(table.into(), rows);
        self
    }

    /// Every request against `table` answers with a 503.
    pub fn failing(mut self, table: impl Into<String>) -> Self {
        self.failing.insert(table.into());
        self
    }

    /// Number of page requests served so far, across all tables.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for MemorySource {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<JsonValue>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.contains(query.table) {
            return Err(FetchError::HttpStatus {
                status: 503,
                table: query.table.to_string(),
                body: "service unavailable".to_string(),
            });
        }

        let Some(rows) = self.tables.get(query.table) else {
            return Err(FetchError::HttpStatus {
                status: 404,
                table: query.table.to_string(),
                body: format!("relation \"public.{}\" does not exist", query.table),
            });
        };

        Ok(rows
            .iter()
            .filter(|row| query.filters.iter().all(|f| matches_filter(row, f)))
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }
}

fn column_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn compare(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn is_match(value: &JsonValue, target: &str) -> bool {
    match target {
        "null" => value.is_null(),
        "true" => value == &JsonValue::Bool(true),
        "false" => value == &JsonValue::Bool(false),
        _ => false,
    }
}

fn matches_filter(row: &JsonValue, filter: &Filter) -> bool {
    let value = row.get(&filter.column).unwrap_or(&JsonValue::Null);
    // SQL comparisons never match NULL.
    let text = column_text(value);
    let compared = |pred: fn(std::cmp::Ordering) -> bool| {
        text.as_deref()
            .is_some_and(|t| pred(compare(t, &filter.value)))
    };

    match filter.op {
        FilterOp::Is => is_match(value, &filter.value),
        FilterOp::NotIs => !is_match(value, &filter.value),
        FilterOp::Eq => text.as_deref() == Some(filter.value.as_str()),
        FilterOp::Neq => text.as_deref().is_some_and(|t| t != filter.value),
        FilterOp::Gt => compared(std::cmp::Ordering::is_gt),
        FilterOp::Gte => compared(std::cmp::Ordering::is_ge),
        FilterOp::Lt => compared(std::cmp::Ordering::is_lt),
        FilterOp::Lte => compared(std::cmp::Ordering::is_le),
        FilterOp::In => text.as_deref().is_some_and(|t| {
            filter
                .value
                .trim_start_matches('(')
                .trim_end_matches(')')
                .split(',')
                .any(|candidate| candidate.trim().trim_matches('"') == t)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<JsonValue> {
        vec![
            json!({ "email_id": "a@x.com", "category": "Personal", "qual": "Q0", "season": "Season 12" }),
            json!({ "email_id": "b@x.com", "category": "Team", "qual": "Q1", "season": "Season 13" }),
            json!({ "email_id": "c@x.com", "category": "Personal", "qual": null, "season": "Season 11" }),
            json!({ "email_id": "d@x.com", "category": "Personal", "season": "Season 10" }),
        ]
    }

    async fn emails(source: &MemorySource, filters: &[Filter]) -> Vec<String> {
        let query = PageQuery {
            table: "rhwb_meso_scores",
            select: &["email_id"],
            filters,
            offset: 0,
            limit: 1000,
        };
        source
            .fetch_page(&query)
            .await
            .expect("page")
            .into_iter()
            .map(|row| row["email_id"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn eq_and_not_null_filters_combine() {
        let source = MemorySource::new().with_rows("rhwb_meso_scores", rows());
        let filters = [Filter::eq("category", "Personal"), Filter::not_null("qual")];
        assert_eq!(emails(&source, &filters).await, vec!["a@x.com"]);
    }

    #[tokio::test]
    async fn missing_columns_behave_like_null() {
        let source = MemorySource::new().with_rows("rhwb_meso_scores", rows());
        assert_eq!(
            emails(&source, &[Filter::is_null("qual")]).await,
            vec!["c@x.com", "d@x.com"]
        );
    }

    #[tokio::test]
    async fn in_filter_matches_listed_values() {
        let source = MemorySource::new().with_rows("rhwb_meso_scores", rows());
        let filter = Filter::new("email_id", FilterOp::In, "(b@x.com,\"d@x.com\")");
        assert_eq!(emails(&source, &[filter]).await, vec!["b@x.com", "d@x.com"]);
    }

    #[tokio::test]
    async fn unknown_table_is_a_not_found_error() {
        let source = MemorySource::new();
        let query = PageQuery {
            table: "nope",
            select: &["id"],
            filters: &[],
            offset: 0,
            limit: 10,
        };
        let err = source.fetch_page(&query).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }
}

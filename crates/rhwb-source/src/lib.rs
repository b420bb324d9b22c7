//! Paginated read access to the Supabase (PostgREST) source tables.

use std::fmt;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Url;
use rhwb_core::SourceTable;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub mod memory;

pub use memory::MemorySource;

pub const CRATE_NAME: &str = "rhwb-source";

/// Hard per-request row cap enforced by the Supabase API.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Is,
    NotIs,
    In,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Is => "is",
            Self::NotIs => "not.is",
            Self::In => "in",
        }
    }
}

/// One `(column, operator, value)` predicate, rendered as `column=op.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::NotIs, "null")
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::new(column, FilterOp::Is, "null")
    }

    pub fn query_value(&self) -> String {
        format!("{}.{}", self.op.as_str(), self.value)
    }
}

/// A single range-bounded request against one table.
#[derive(Debug, Clone, Copy)]
pub struct PageQuery<'a> {
    pub table: &'a str,
    pub select: &'a [&'a str],
    pub filters: &'a [Filter],
    pub offset: usize,
    pub limit: usize,
}

impl PageQuery<'_> {
    pub fn select_clause(&self) -> String {
        self.select
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Query string pairs in the order PostgREST receives them.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), self.select_clause())];
        pairs.extend(
            self.filters
                .iter()
                .map(|f| (f.column.clone(), f.query_value())),
        );
        pairs.push(("offset".to_string(), self.offset.to_string()));
        pairs.push(("limit".to_string(), self.limit.to_string()));
        pairs
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} reading {table}: {body}")]
    HttpStatus {
        status: u16,
        table: String,
        body: String,
    },
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("row {index} of {table} does not match the expected shape: {source}")]
    Decode {
        table: String,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Anything able to serve one page of rows for a table.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<JsonValue>, FetchError>;
}

#[derive(Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
}

impl fmt::Debug for SupabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseConfig")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .finish()
    }
}

/// PostgREST client authenticated with the service role key.
#[derive(Debug)]
pub struct SupabaseClient {
    client: reqwest::Client,
    rest_base: Url,
    api_key: HeaderValue,
    bearer: HeaderValue,
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building reqwest client")?;
        let rest_base = rest_base_url(&config.url)?;

        let mut api_key = HeaderValue::from_str(&config.service_key)
            .context("service key is not a valid header value")?;
        api_key.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        bearer.set_sensitive(true);

        Ok(Self {
            client,
            rest_base,
            api_key,
            bearer,
        })
    }

    pub fn table_url(&self, table: &str) -> Result<Url, FetchError> {
        self.rest_base
            .join(table)
            .map_err(|err| FetchError::InvalidUrl(format!("{}{table}: {err}", self.rest_base)))
    }

    pub fn request_for(&self, query: &PageQuery<'_>) -> Result<reqwest::Request, FetchError> {
        let url = self.table_url(query.table)?;
        let request = self
            .client
            .get(url)
            .query(&query.query_pairs())
            .header("apikey", self.api_key.clone())
            .header(AUTHORIZATION, self.bearer.clone())
            .header(ACCEPT, "application/json")
            .build()?;
        Ok(request)
    }
}

#[async_trait]
impl PageSource for SupabaseClient {
    async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<JsonValue>, FetchError> {
        let request = self.request_for(query)?;
        let resp = self.client.execute(request).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                table: query.table.to_string(),
                body,
            });
        }
        Ok(resp.json::<Vec<JsonValue>>().await?)
    }
}

fn rest_base_url(project_url: &str) -> anyhow::Result<Url> {
    let base = format!("{}/rest/v1/", project_url.trim().trim_end_matches('/'));
    Url::parse(&base).with_context(|| format!("parsing supabase url {project_url:?}"))
}

/// Read every matching row, one page at a time, until a page comes back
/// shorter than `page_size`. A table holding an exact multiple of
/// `page_size` rows therefore costs one trailing empty request.
pub async fn fetch_all_paginated<S>(
    source: &S,
    table: &str,
    select: &[&str],
    filters: &[Filter],
    page_size: usize,
) -> Result<Vec<JsonValue>, FetchError>
where
    S: PageSource + ?Sized,
{
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0usize;

    loop {
        let query = PageQuery {
            table,
            select,
            filters,
            offset,
            limit: page_size,
        };
        let page = source.fetch_page(&query).await?;
        let page_len = page.len();
        rows.extend(page);
        debug!(table, offset, page_len, total = rows.len(), "fetched page");

        if page_len < page_size {
            break;
        }
        offset += page_size;
    }

    Ok(rows)
}

/// [`fetch_all_paginated`] plus decoding every row into the table's row type.
pub async fn fetch_all_typed<T, S>(
    source: &S,
    table: SourceTable,
    select: &[&str],
    filters: &[Filter],
    page_size: usize,
) -> Result<Vec<T>, FetchError>
where
    T: DeserializeOwned,
    S: PageSource + ?Sized,
{
    let rows = fetch_all_paginated(source, table.as_str(), select, filters, page_size)
        .instrument(info_span!("fetch", table = %table))
        .await?;
    decode_rows(table, rows)
}

pub fn decode_rows<T: DeserializeOwned>(
    table: SourceTable,
    rows: Vec<JsonValue>,
) -> Result<Vec<T>, FetchError> {
    rows.into_iter()
        .enumerate()
        .map(|(index, row)| {
            serde_json::from_value(row).map_err(|source| FetchError::Decode {
                table: table.to_string(),
                index,
                source,
            })
        })
        .collect()
}

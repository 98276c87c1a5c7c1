//! Persistence (Postgres via sqlx) + shared HTTP fetch utilities for MTR.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mtr_core::{LineItem, Opportunity, OpportunityStatus, Priority};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mtr-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {detail}")]
    Json { url: String, detail: String },
}

impl FetchError {
    /// Non-200 responses that simply mean "nothing here" for a probe,
    /// as opposed to transport-level failures.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared outbound HTTP client: bounded timeout, capped exponential
/// backoff on retryable failures, global and per-source concurrency
/// limits. Collector and resolver calls all go through here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let response = self.fetch_bytes(run_id, source_id, url, query).await?;
        serde_json::from_slice(&response.body).map_err(|err| FetchError::Json {
            url: response.final_url,
            detail: err.to_string(),
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, FetchError> {
        let response = self.fetch_bytes(run_id, source_id, url, query).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }
}

/// Stable synthetic identifier for candidates that carry no upstream
/// tender id (the news scraper path). Same title+link always hashes to
/// the same id, so reprocessing a window stays idempotent.
pub fn synthetic_tender_id(title: &str, link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f]);
    hasher.update(link.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("hash-{}", &digest[..20])
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt row for `{tender_id}`: {detail}")]
    Corrupt { tender_id: String, detail: String },
}

#[derive(Debug, Clone, Default)]
pub struct OpportunityFilter {
    pub status: Option<OpportunityStatus>,
    pub limit: Option<i64>,
    pub offset: i64,
}

/// The sole write surface over persisted opportunities.
///
/// `insert_if_absent` is the only path that creates a row; everything
/// else requires the row to exist already. Enrichment writes only the
/// analysis fields and can never change status or priority.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn insert_if_absent(&self, opportunity: &Opportunity) -> Result<bool, StoreError>;
    async fn set_analysis(&self, tender_id: &str, summary: &str, risk: &str)
        -> Result<(), StoreError>;
    async fn set_status(
        &self,
        tender_id: &str,
        status: OpportunityStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;
    async fn get(&self, tender_id: &str) -> Result<Option<Opportunity>, StoreError>;
    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>, StoreError>;
    async fn fetch_unanalyzed(&self, limit: i64) -> Result<Vec<Opportunity>, StoreError>;
}

/// Line items are write-once per tender: one transactional insert of
/// the full mapped batch, reads thereafter.
#[async_trait]
pub trait LineItemStore: Send + Sync {
    async fn items_for(&self, tender_id: &str) -> Result<Vec<LineItem>, StoreError>;
    async fn insert_items(&self, tender_id: &str, items: &[LineItem]) -> Result<(), StoreError>;
}

/// Postgres-backed store.
///
/// Expected schema (managed externally):
/// `opportunities(tender_id text primary key, title, organ_name,
/// organ_cnpj, region_code, municipality, published_at, opens_at,
/// edital_link, category, status, rejection_reason, me_epp_exclusive,
/// priority, score, ai_summary, ai_risk, created_at, updated_at)` and
/// `line_items(tender_id references opportunities on delete cascade,
/// item_number, description, quantity, unit, unit_price,
/// provider_code)`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, StoreError> {
    let tender_id: String = row.try_get("tender_id")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let corrupt = |detail: String| StoreError::Corrupt {
        tender_id: tender_id.clone(),
        detail,
    };
    Ok(Opportunity {
        status: status.parse::<OpportunityStatus>().map_err(corrupt)?,
        priority: priority.parse::<Priority>().map_err(corrupt)?,
        tender_id: tender_id.clone(),
        title: row.try_get("title")?,
        organ_name: row.try_get("organ_name")?,
        organ_cnpj: row.try_get("organ_cnpj")?,
        region_code: row.try_get("region_code")?,
        municipality: row.try_get("municipality")?,
        published_at: row.try_get("published_at")?,
        opens_at: row.try_get("opens_at")?,
        edital_link: row.try_get("edital_link")?,
        category: row.try_get("category")?,
        rejection_reason: row.try_get("rejection_reason")?,
        me_epp_exclusive: row.try_get("me_epp_exclusive")?,
        score: row.try_get("score")?,
        ai_summary: row.try_get("ai_summary")?,
        ai_risk: row.try_get("ai_risk")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const OPPORTUNITY_COLUMNS: &str = "tender_id, title, organ_name, organ_cnpj, region_code, \
     municipality, published_at, opens_at, edital_link, category, status, rejection_reason, \
     me_epp_exclusive, priority, score, ai_summary, ai_risk, created_at, updated_at";

#[async_trait]
impl OpportunityStore for PgStore {
    async fn insert_if_absent(&self, opportunity: &Opportunity) -> Result<bool, StoreError> {
        // ON CONFLICT DO NOTHING doubles as the race arbiter: a
        // concurrent run losing the uniqueness check sees `false`,
        // never a duplicate row.
        let result = sqlx::query(
            r#"
            INSERT INTO opportunities (
                tender_id, title, organ_name, organ_cnpj, region_code, municipality,
                published_at, opens_at, edital_link, category, status, rejection_reason,
                me_epp_exclusive, priority, score, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (tender_id) DO NOTHING
            "#,
        )
        .bind(&opportunity.tender_id)
        .bind(&opportunity.title)
        .bind(&opportunity.organ_name)
        .bind(&opportunity.organ_cnpj)
        .bind(&opportunity.region_code)
        .bind(&opportunity.municipality)
        .bind(opportunity.published_at)
        .bind(opportunity.opens_at)
        .bind(&opportunity.edital_link)
        .bind(&opportunity.category)
        .bind(opportunity.status.as_str())
        .bind(&opportunity.rejection_reason)
        .bind(opportunity.me_epp_exclusive)
        .bind(opportunity.priority.as_str())
        .bind(opportunity.score)
        .bind(opportunity.created_at)
        .bind(opportunity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_analysis(
        &self,
        tender_id: &str,
        summary: &str,
        risk: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE opportunities
               SET ai_summary = $2,
                   ai_risk = $3,
                   updated_at = NOW()
             WHERE tender_id = $1
            "#,
        )
        .bind(tender_id)
        .bind(summary)
        .bind(risk)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        tender_id: &str,
        status: OpportunityStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET status = $2,
                   rejection_reason = $3,
                   updated_at = NOW()
             WHERE tender_id = $1
            "#,
        )
        .bind(tender_id)
        .bind(status.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, tender_id: &str) -> Result<Option<Opportunity>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE tender_id = $1"
        ))
        .bind(tender_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }

    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY published_at DESC NULLS LAST, created_at DESC
             LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.unwrap_or(50))
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    async fn fetch_unanalyzed(&self, limit: i64) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OPPORTUNITY_COLUMNS}
              FROM opportunities
             WHERE ai_summary IS NULL
               AND status IN ('recebido', 'aprovado')
             ORDER BY created_at
             LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }
}

#[async_trait]
impl LineItemStore for PgStore {
    async fn items_for(&self, tender_id: &str) -> Result<Vec<LineItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_number, description, quantity, unit, unit_price, provider_code
              FROM line_items
             WHERE tender_id = $1
             ORDER BY item_number
            "#,
        )
        .bind(tender_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LineItem {
                item_number: row.try_get("item_number")?,
                description: row.try_get("description")?,
                quantity: row.try_get("quantity")?,
                unit: row.try_get("unit")?,
                unit_price: row.try_get("unit_price")?,
                provider_code: row.try_get("provider_code")?,
            });
        }
        Ok(out)
    }

    async fn insert_items(&self, tender_id: &str, items: &[LineItem]) -> Result<(), StoreError> {
        // One transaction per resolution: either the full mapped batch
        // lands or nothing does.
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO line_items
                    (tender_id, item_number, description, quantity, unit, unit_price, provider_code)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(tender_id)
            .bind(item.item_number)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(&item.unit)
            .bind(item.unit_price)
            .bind(&item.provider_code)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// In-memory store, used by tests and offline dry runs. Mirrors the
/// Postgres semantics including the conflict no-op on insert.
#[derive(Debug, Default)]
pub struct MemStore {
    opportunities: Mutex<BTreeMap<String, Opportunity>>,
    items: Mutex<BTreeMap<String, Vec<LineItem>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OpportunityStore for MemStore {
    async fn insert_if_absent(&self, opportunity: &Opportunity) -> Result<bool, StoreError> {
        let mut map = self.opportunities.lock().await;
        if map.contains_key(&opportunity.tender_id) {
            return Ok(false);
        }
        map.insert(opportunity.tender_id.clone(), opportunity.clone());
        Ok(true)
    }

    async fn set_analysis(
        &self,
        tender_id: &str,
        summary: &str,
        risk: &str,
    ) -> Result<(), StoreError> {
        let mut map = self.opportunities.lock().await;
        if let Some(existing) = map.get_mut(tender_id) {
            existing.ai_summary = Some(summary.to_string());
            existing.ai_risk = Some(risk.to_string());
            existing.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn set_status(
        &self,
        tender_id: &str,
        status: OpportunityStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut map = self.opportunities.lock().await;
        match map.get_mut(tender_id) {
            Some(existing) => {
                existing.status = status;
                existing.rejection_reason = reason.map(str::to_string);
                existing.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, tender_id: &str) -> Result<Option<Opportunity>, StoreError> {
        Ok(self.opportunities.lock().await.get(tender_id).cloned())
    }

    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>, StoreError> {
        let map = self.opportunities.lock().await;
        let mut rows: Vec<Opportunity> = map
            .values()
            .filter(|o| filter.status.map(|s| o.status == s).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.unwrap_or(50).max(0) as usize)
            .collect())
    }

    async fn fetch_unanalyzed(&self, limit: i64) -> Result<Vec<Opportunity>, StoreError> {
        let map = self.opportunities.lock().await;
        let mut rows: Vec<Opportunity> = map
            .values()
            .filter(|o| {
                o.ai_summary.is_none()
                    && matches!(
                        o.status,
                        OpportunityStatus::Received | OpportunityStatus::Approved
                    )
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl LineItemStore for MemStore {
    async fn items_for(&self, tender_id: &str) -> Result<Vec<LineItem>, StoreError> {
        Ok(self
            .items
            .lock()
            .await
            .get(tender_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_items(&self, tender_id: &str, items: &[LineItem]) -> Result<(), StoreError> {
        self.items
            .lock()
            .await
            .entry(tender_id.to_string())
            .or_default()
            .extend_from_slice(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mtr_core::Priority;

    fn opportunity(tender_id: &str, status: OpportunityStatus) -> Opportunity {
        let now = Utc::now();
        Opportunity {
            tender_id: tender_id.to_string(),
            title: "Aquisição de medicamentos".into(),
            organ_name: "Prefeitura de São Luís".into(),
            organ_cnpj: Some("12345678000190".into()),
            region_code: "MA".into(),
            municipality: Some("São Luís".into()),
            published_at: Some(now),
            opens_at: None,
            edital_link: "https://example.gov.br/edital/1".into(),
            category: None,
            status,
            rejection_reason: None,
            me_epp_exclusive: false,
            priority: Priority::Alta,
            score: 30,
            ai_summary: None,
            ai_risk: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn synthetic_ids_are_stable_and_distinct() {
        let a = synthetic_tender_id("Aquisição de luvas", "https://a.gov.br/1");
        let b = synthetic_tender_id("Aquisição de luvas", "https://a.gov.br/1");
        let c = synthetic_tender_id("Aquisição de luvas", "https://a.gov.br/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("hash-"));
        assert_eq!(a.len(), "hash-".len() + 20);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_tender_id() {
        let store = MemStore::new();
        let first = opportunity("12345678000190-2025-94", OpportunityStatus::Received);

        assert!(store.insert_if_absent(&first).await.unwrap());

        // A later run re-classifying the same tender never overwrites
        // the original admission decision.
        let mut second = first.clone();
        second.status = OpportunityStatus::Rejected;
        second.rejection_reason = Some("blacklist match".into());
        assert!(!store.insert_if_absent(&second).await.unwrap());

        let stored = store.get("12345678000190-2025-94").await.unwrap().unwrap();
        assert_eq!(stored.status, OpportunityStatus::Received);
        assert_eq!(stored.rejection_reason, None);
    }

    #[tokio::test]
    async fn analysis_update_never_touches_status_or_priority() {
        let store = MemStore::new();
        let op = opportunity("12345678000190-2025-95", OpportunityStatus::Received);
        store.insert_if_absent(&op).await.unwrap();

        store
            .set_analysis("12345678000190-2025-95", "resumo", "risco baixo")
            .await
            .unwrap();

        let stored = store.get("12345678000190-2025-95").await.unwrap().unwrap();
        assert_eq!(stored.ai_summary.as_deref(), Some("resumo"));
        assert_eq!(stored.ai_risk.as_deref(), Some("risco baixo"));
        assert_eq!(stored.status, OpportunityStatus::Received);
        assert_eq!(stored.priority, Priority::Alta);
        assert!(stored.updated_at >= op.updated_at);
    }

    #[tokio::test]
    async fn unanalyzed_fetch_skips_rejected_and_enriched_rows() {
        let store = MemStore::new();
        store
            .insert_if_absent(&opportunity("a-2025-1", OpportunityStatus::Received))
            .await
            .unwrap();
        store
            .insert_if_absent(&opportunity("a-2025-2", OpportunityStatus::Rejected))
            .await
            .unwrap();
        let mut enriched = opportunity("a-2025-3", OpportunityStatus::Approved);
        enriched.ai_summary = Some("done".into());
        store.insert_if_absent(&enriched).await.unwrap();

        let pending = store.fetch_unanalyzed(10).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|o| o.tender_id.as_str()).collect();
        assert_eq!(ids, vec!["a-2025-1"]);
    }

    #[tokio::test]
    async fn line_items_round_trip_through_mem_store() {
        let store = MemStore::new();
        let items = vec![LineItem {
            item_number: 1,
            description: "Luva cirúrgica estéril".into(),
            quantity: 2160.0,
            unit: "UN".into(),
            unit_price: 53.12,
            provider_code: Some("BR0439".into()),
        }];
        store.insert_items("a-2025-1", &items).await.unwrap();
        assert_eq!(store.items_for("a-2025-1").await.unwrap(), items);
        assert!(store.items_for("a-2025-9").await.unwrap().is_empty());
    }
}

//! Tender source adapters + the line-item resolver for MTR.
//!
//! Two collectors feed the pipeline: the official PNCP publication API
//! and a best-effort news-page scraper. Both emit the same transient
//! `RawCandidate` shape; admission is always re-decided downstream by
//! the filter engine, so everything here pre-filters only coarsely.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mtr_core::{CorrelationId, LineItem, RawCandidate, TenderId, TenderIdError};
use mtr_storage::{synthetic_tender_id, FetchError, HttpFetcher, LineItemStore, StoreError};
use scraper::{Html, Selector};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mtr-sources";

/// Per-run collection parameters shared by every source.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub region_codes: Vec<String>,
}

impl CollectContext {
    pub fn window_start_param(&self) -> String {
        self.window_start.format("%Y%m%d").to_string()
    }

    pub fn window_end_param(&self) -> String {
        self.window_end.format("%Y%m%d").to_string()
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {url}: {detail}")]
    Payload { url: String, detail: String },
}

/// A single upstream of tender candidates. Failure of one source never
/// aborts the others; the orchestrator treats an `Err` as an empty
/// contribution for the run.
#[async_trait]
pub trait TenderSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, SourceError>;
}

/// Obvious-junk titles both collectors drop before emitting, purely as
/// a cost-reduction heuristic.
pub fn default_junk_terms() -> Vec<String> {
    [
        "são paulo", "rio de janeiro", "minas", "concurso", "polícia", "vaga",
        "futebol", "show", "crime",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

fn passes_coarse_filter(title: &str, junk_terms: &[String]) -> bool {
    let title = title.to_lowercase();
    !junk_terms.iter().any(|t| title.contains(t.as_str()))
}

// ---------------------------------------------------------------------------
// Official PNCP publication API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PncpSourceConfig {
    pub api_base: String,
    pub portal_base: String,
    /// Procurement modality codes queried per region: pregão,
    /// dispensa, concorrência.
    pub modalities: Vec<u16>,
    pub page_size: u32,
    pub junk_terms: Vec<String>,
}

impl Default for PncpSourceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://pncp.gov.br/api/consulta/v1".to_string(),
            portal_base: "https://pncp.gov.br/app/editais".to_string(),
            modalities: vec![6, 8, 13],
            page_size: 50,
            junk_terms: default_junk_terms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PncpPublicationSource {
    config: PncpSourceConfig,
}

impl PncpPublicationSource {
    pub fn new(config: PncpSourceConfig) -> Self {
        Self { config }
    }
}

impl Default for PncpPublicationSource {
    fn default() -> Self {
        Self::new(PncpSourceConfig::default())
    }
}

#[async_trait]
impl TenderSource for PncpPublicationSource {
    fn source_id(&self) -> &'static str {
        "pncp"
    }

    /// Walks the date window per region × modality. A failing query is
    /// isolated to that (region, modality) pair; malformed records are
    /// skipped row by row, never aborting the page.
    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, SourceError> {
        let url = format!("{}/contratacoes/publicacao", self.config.api_base);
        let mut out = Vec::new();

        for uf in &ctx.region_codes {
            for modality in &self.config.modalities {
                let query = [
                    ("dataInicial", ctx.window_start_param()),
                    ("dataFinal", ctx.window_end_param()),
                    ("uf", uf.clone()),
                    ("codigoModalidadeContratacao", modality.to_string()),
                    ("pagina", "1".to_string()),
                    ("tamanhoPagina", self.config.page_size.to_string()),
                ];

                let payload = match http.fetch_json(ctx.run_id, self.source_id(), &url, &query).await
                {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%uf, modality, error = %err, "publication query failed; skipping window slice");
                        continue;
                    }
                };

                let records = payload
                    .get("data")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                for record in &records {
                    let Some(candidate) = map_publication_record(
                        record,
                        uf,
                        &self.config.portal_base,
                        CorrelationId::derive(ctx.run_id, self.source_id(), out.len()),
                        self.source_id(),
                    ) else {
                        debug!(%uf, "skipping malformed publication record");
                        continue;
                    };
                    if !passes_coarse_filter(&candidate.title, &self.config.junk_terms) {
                        continue;
                    }
                    out.push(candidate);
                }
            }
        }

        Ok(out)
    }
}

fn json_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Numbers arrive as JSON numbers or numeric strings depending on the
/// API generation; accept both.
fn json_f64(value: &Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_i64(value: &Value, key: &str) -> Option<i64> {
    let v = value.get(key)?;
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// PNCP publishes timestamps with and without a zone offset.
fn parse_pncp_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

fn map_publication_record(
    record: &Value,
    uf: &str,
    portal_base: &str,
    correlation: CorrelationId,
    source: &str,
) -> Option<RawCandidate> {
    let organ = record.get("orgaoEntidade")?;
    let cnpj = json_string(organ, "cnpj")?;
    let year = json_i64(record, "anoCompra")?;
    let sequence = json_i64(record, "sequencialCompra")?;
    let title = json_string(record, "objetoCompra")?;

    let tender_id = format!("{cnpj}-{year}-{sequence}");
    let organ_name =
        json_string(organ, "razaoSocial").unwrap_or_else(|| "Desconhecido".to_string());
    let municipality = record
        .get("unidadeOrgao")
        .and_then(|unit| json_string(unit, "municipioNome"));

    Some(RawCandidate {
        correlation,
        source: source.to_string(),
        edital_link: format!("{portal_base}/{cnpj}/{year}/{sequence}"),
        tender_id,
        body: title.clone(),
        title,
        organ_name,
        organ_cnpj: Some(cnpj),
        region_code: uf.to_string(),
        municipality,
        published_at: json_string(record, "dataPublicacaoPncp")
            .and_then(|s| parse_pncp_timestamp(&s)),
        opens_at: json_string(record, "dataAberturaProposta")
            .and_then(|s| parse_pncp_timestamp(&s)),
        category: json_string(record, "modalidadeNome"),
    })
}

// ---------------------------------------------------------------------------
// News-page scraper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewsSourceConfig {
    pub listing_url: String,
    pub item_selector: String,
    pub title_selector: String,
    pub junk_terms: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub max_results: usize,
    pub fetch_bodies: bool,
}

impl Default for NewsSourceConfig {
    fn default() -> Self {
        Self {
            listing_url: "https://news.google.com/search?q=licita%C3%A7%C3%A3o%20%22aviso%20de%20licita%C3%A7%C3%A3o%22%20(medicamentos%20OR%20hospitalar)&hl=pt-BR&gl=BR"
                .to_string(),
            item_selector: "article".to_string(),
            title_selector: "h3, h4, .title".to_string(),
            junk_terms: default_junk_terms(),
            blocked_domains: [
                "globo.com", "terra.com.br", "uol.com.br", "folha", "estadao",
                "metropoles", "concurso", "jusbrasil",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
            max_results: 10,
            fetch_bodies: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewsSource {
    config: NewsSourceConfig,
}

impl NewsSource {
    pub fn new(config: NewsSourceConfig) -> Self {
        Self { config }
    }
}

impl Default for NewsSource {
    fn default() -> Self {
        Self::new(NewsSourceConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsEntry {
    pub title: String,
    pub link: String,
}

/// Pulls (title, link) pairs out of a listing page. Entries without a
/// resolvable title or href are dropped silently; this is a scraper,
/// not a contract.
pub fn parse_news_entries(html: &str, config: &NewsSourceConfig) -> Vec<NewsEntry> {
    let Ok(item_sel) = Selector::parse(&config.item_selector) else {
        return Vec::new();
    };
    let Ok(title_sel) = Selector::parse(&config.title_selector) else {
        return Vec::new();
    };
    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    for item in document.select(&item_sel) {
        let title = item
            .select(&title_sel)
            .next()
            .map(|n| n.text().collect::<String>())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let href = item
            .select(&anchor_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(|h| normalize_link(&config.listing_url, h))
            .filter(|h| !h.is_empty());
        if let (Some(title), Some(link)) = (title, href) {
            out.push(NewsEntry { title, link });
        }
    }
    out
}

/// Resolves relative hrefs against the listing page's origin.
fn normalize_link(listing_url: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let origin = listing_url
        .find("://")
        .and_then(|scheme_end| {
            listing_url[scheme_end + 3..]
                .find('/')
                .map(|path_start| &listing_url[..scheme_end + 3 + path_start])
        })
        .unwrap_or(listing_url);
    let href = href.trim_start_matches('.');
    if href.starts_with('/') {
        format!("{origin}{href}")
    } else {
        format!("{origin}/{href}")
    }
}

fn is_blocked_domain(link: &str, blocked: &[String]) -> bool {
    let link = link.to_lowercase();
    blocked.iter().any(|d| link.contains(d.as_str()))
}

/// Best-effort region guess from free text. The bare siglas are only
/// matched as standalone tokens; "pará" needs its accent to avoid the
/// preposition.
pub fn region_hint(text: &str) -> Option<String> {
    let padded = format!(" {} ", text.to_lowercase());
    const HINTS: &[(&str, &[&str])] = &[
        ("MA", &["maranhão", "maranhao", " ma "]),
        ("PI", &["piauí", "piaui", " pi "]),
        ("PA", &["pará", " pa "]),
    ];
    for (code, needles) in HINTS {
        if needles.iter().any(|n| padded.contains(n)) {
            return Some((*code).to_string());
        }
    }
    None
}

fn host_of(link: &str) -> Option<String> {
    let rest = link.split("://").nth(1)?;
    let host = rest.split('/').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn extract_page_text(html: &str, limit_chars: usize) -> Option<String> {
    let Ok(paragraph_sel) = Selector::parse("article p, p") else {
        return None;
    };
    let document = Html::parse_document(html);
    let text = document
        .select(&paragraph_sel)
        .map(|p| p.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.len() < 80 {
        return None;
    }
    Some(text.chars().take(limit_chars).collect())
}

#[async_trait]
impl TenderSource for NewsSource {
    fn source_id(&self) -> &'static str {
        "news"
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &CollectContext,
    ) -> Result<Vec<RawCandidate>, SourceError> {
        let html = http
            .fetch_text(ctx.run_id, self.source_id(), &self.config.listing_url, &[])
            .await?;
        let entries = parse_news_entries(&html, &self.config);
        debug!(raw = entries.len(), "news listing parsed");

        let mut out = Vec::new();
        for entry in entries {
            if out.len() >= self.config.max_results {
                break;
            }
            if !passes_coarse_filter(&entry.title, &self.config.junk_terms) {
                continue;
            }
            if is_blocked_domain(&entry.link, &self.config.blocked_domains) {
                debug!(link = %entry.link, "skipping blocked news portal");
                continue;
            }

            let mut body = entry.title.clone();
            if self.config.fetch_bodies {
                match http.fetch_text(ctx.run_id, self.source_id(), &entry.link, &[]).await {
                    Ok(page) => {
                        if let Some(text) = extract_page_text(&page, 2000) {
                            body = format!("{}\n{}", entry.title, text);
                        }
                    }
                    Err(err) => {
                        warn!(link = %entry.link, error = %err, "news detail fetch failed; keeping title only");
                    }
                }
            }

            let region_code =
                region_hint(&format!("{} {}", entry.title, body)).unwrap_or_else(|| "BR".to_string());
            let organ_name = host_of(&entry.link).unwrap_or_else(|| "Automação".to_string());

            out.push(RawCandidate {
                correlation: CorrelationId::derive(ctx.run_id, self.source_id(), out.len()),
                source: self.source_id().to_string(),
                tender_id: synthetic_tender_id(&entry.title, &entry.link),
                title: entry.title,
                organ_name,
                organ_cnpj: None,
                region_code,
                municipality: None,
                body,
                edital_link: entry.link,
                published_at: None,
                opens_at: None,
                category: None,
            });
        }

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Line-item resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ItemResolverConfig {
    /// Current-generation API; reached first with every padding variant.
    pub current_api_base: String,
    /// Legacy generation; zero-padded sequences only.
    pub legacy_api_base: String,
    /// Public portal, scraped as the last resort.
    pub portal_base: String,
    pub page_size: u32,
    pub page_cap: u32,
}

impl Default for ItemResolverConfig {
    fn default() -> Self {
        Self {
            current_api_base: "https://pncp.gov.br/pncp-api/v1".to_string(),
            legacy_api_base: "https://pncp.gov.br/api/consulta/v1".to_string(),
            portal_base: "https://pncp.gov.br/app/editais".to_string(),
            page_size: 50,
            page_cap: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Id(#[from] TenderIdError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves the priced item list of an accepted tender.
///
/// Idempotent: if items already exist locally the stored set is
/// returned without touching the network. Otherwise the upstream is
/// probed variant by variant (the sequence is inconsistently padded
/// across API generations), the first productive variant is paginated
/// to exhaustion, and only a fully mapped batch is committed.
#[derive(Debug, Clone, Default)]
pub struct ItemResolver {
    config: ItemResolverConfig,
}

impl ItemResolver {
    pub fn new(config: ItemResolverConfig) -> Self {
        Self { config }
    }

    pub async fn resolve(
        &self,
        http: &HttpFetcher,
        store: &dyn LineItemStore,
        tender_id: &str,
    ) -> Result<Vec<LineItem>, ResolveError> {
        let existing = store.items_for(tender_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let id = TenderId::parse(tender_id)?;
        let probe_id = Uuid::new_v4();

        for variant in id.sequence_variants() {
            let items = self
                .fetch_paginated(http, &self.config.current_api_base, &id, &variant, probe_id)
                .await;
            if !items.is_empty() {
                store.insert_items(tender_id, &items).await?;
                return Ok(items);
            }
        }

        for variant in id.padded_variants() {
            let items = self
                .fetch_single_page(http, &self.config.legacy_api_base, &id, &variant, probe_id)
                .await;
            if !items.is_empty() {
                store.insert_items(tender_id, &items).await?;
                return Ok(items);
            }
        }

        let items = self.scrape_portal(http, &id, probe_id).await;
        if !items.is_empty() {
            store.insert_items(tender_id, &items).await?;
            return Ok(items);
        }

        warn!(tender_id, "no line items found via any variant, generation, or the portal");
        Ok(Vec::new())
    }

    async fn fetch_paginated(
        &self,
        http: &HttpFetcher,
        base: &str,
        id: &TenderId,
        variant: &str,
        probe_id: Uuid,
    ) -> Vec<LineItem> {
        let url = format!("{base}/orgaos/{}/compras/{}/{variant}/itens", id.cnpj, id.year);
        let mut out = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [
                ("pagina", page.to_string()),
                ("tamanhoPagina", self.config.page_size.to_string()),
            ];
            let payload = match http.fetch_json(probe_id, "pncp-itens", &url, &query).await {
                Ok(value) => value,
                Err(err) => {
                    debug!(variant, page, error = %err, "item page fetch failed for variant");
                    break;
                }
            };

            let rows = extract_item_rows(&payload);
            if rows.is_empty() {
                break;
            }
            for (index, row) in rows.iter().enumerate() {
                let fallback_number = ((page - 1) * self.config.page_size) as i32 + index as i32 + 1;
                match map_item_row(row, fallback_number) {
                    Some(item) => out.push(item),
                    None => warn!(variant, page, index, "skipping unmappable item row"),
                }
            }

            page += 1;
            if page > self.config.page_cap {
                break;
            }
        }

        out
    }

    async fn fetch_single_page(
        &self,
        http: &HttpFetcher,
        base: &str,
        id: &TenderId,
        variant: &str,
        probe_id: Uuid,
    ) -> Vec<LineItem> {
        let url = format!("{base}/orgaos/{}/compras/{}/{variant}/itens", id.cnpj, id.year);
        let payload = match http.fetch_json(probe_id, "pncp-itens-legacy", &url, &[]).await {
            Ok(value) => value,
            Err(err) => {
                if err.http_status() != Some(404) {
                    warn!(variant, error = %err, "legacy item fetch failed");
                }
                return Vec::new();
            }
        };

        let rows = extract_item_rows(&payload);
        let mut out = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            match map_item_row(row, index as i32 + 1) {
                Some(item) => out.push(item),
                None => warn!(variant, index, "skipping unmappable legacy item row"),
            }
        }
        out
    }

    async fn scrape_portal(&self, http: &HttpFetcher, id: &TenderId, probe_id: Uuid) -> Vec<LineItem> {
        // The portal URL takes the bare integer sequence.
        let Some(bare) = id.sequence_variants().next() else {
            return Vec::new();
        };
        let url = format!("{}/{}/{}/{bare}", self.config.portal_base, id.cnpj, id.year);
        let mut out = Vec::new();

        for page in 1..=self.config.page_cap {
            let html = match http
                .fetch_text(probe_id, "pncp-portal", &url, &[("pagina", page.to_string())])
                .await
            {
                Ok(html) => html,
                Err(err) => {
                    warn!(page, error = %err, "portal fetch failed");
                    break;
                }
            };
            let rows = parse_portal_item_rows(&html);
            if rows.is_empty() {
                break;
            }
            out.extend(rows);
        }

        out
    }
}

fn extract_item_rows(payload: &Value) -> Vec<Value> {
    if let Some(rows) = payload.as_array() {
        return rows.clone();
    }
    for key in ["data", "items"] {
        if let Some(rows) = payload.get(key).and_then(Value::as_array) {
            return rows.clone();
        }
    }
    Vec::new()
}

/// Maps one wire item onto the domain shape with the documented
/// permissive defaults: quantity 1.0, price 0.0, unit "UN".
fn map_item_row(row: &Value, fallback_number: i32) -> Option<LineItem> {
    if !row.is_object() {
        return None;
    }
    Some(LineItem {
        item_number: json_i64(row, "numeroItem")
            .map(|n| n as i32)
            .unwrap_or(fallback_number),
        description: json_string(row, "descricao").unwrap_or_else(|| "Sem descrição".to_string()),
        quantity: json_f64(row, "quantidade").unwrap_or(1.0),
        unit: json_string(row, "unidadeMedida").unwrap_or_else(|| "UN".to_string()),
        unit_price: json_f64(row, "valorUnitarioEstimado").unwrap_or(0.0),
        provider_code: row.get("codigoItem").and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
    })
}

/// Parses Brazilian-locale numerics: thousands dots, decimal comma,
/// optional currency prefix. `"2.160,00"` → 2160.0, `"R$ 53,12"` → 53.12.
pub fn parse_locale_number(raw: &str) -> Option<f64> {
    let stripped = raw.replace("R$", "");
    let cleaned = stripped.trim().replace('.', "").replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// Extracts item rows from the portal's rendered data table. Rows with
/// fewer than four cells or unparsable cells are skipped, never fatal.
pub fn parse_portal_item_rows(html: &str) -> Vec<LineItem> {
    let Ok(row_sel) = Selector::parse("datatable-body-row") else {
        return Vec::new();
    };
    let Ok(cell_sel) = Selector::parse("datatable-body-cell") else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 4 {
            continue;
        }
        out.push(LineItem {
            item_number: cells[0].parse().unwrap_or(0),
            description: cells[1].clone(),
            quantity: parse_locale_number(&cells[2]).unwrap_or(0.0),
            unit: "UN".to_string(),
            unit_price: parse_locale_number(&cells[3]).unwrap_or(0.0),
            provider_code: None,
        });
    }
    out
}

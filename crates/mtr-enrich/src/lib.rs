//! AI enrichment orchestration for MTR.
//!
//! Providers are an ordered strategy list built once at startup; a
//! missing API key means the strategy is simply not in the list, never
//! a null check at call time. Whatever the providers do, the
//! reconciliation step guarantees exactly one analysis per input.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mtr_core::{CorrelationId, FilterVocabulary};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mtr-enrich";

pub const DEFAULT_BATCH_SIZE: usize = 5;

/// One candidate as handed to the analysis chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisInput {
    pub correlation: CorrelationId,
    pub title: String,
    pub body: String,
}

/// One analysis verdict, matched back to its input by correlation id,
/// never by position.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub correlation: CorrelationId,
    pub summary: String,
    pub score: i32,
    pub risk: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider http status {0}")]
    Status(u16),
    #[error("provider contract violation: {0}")]
    Contract(String),
}

/// A single analysis strategy: the whole batch in, one result per
/// analyzed item out. Partial coverage is legal; total failure is an
/// error and discards the batch result entirely.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn analyze(&self, batch: &[AnalysisInput]) -> Result<Vec<Analysis>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ChatProviderConfig {
    pub name: &'static str,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl ChatProviderConfig {
    pub fn groq(api_key: String, model: Option<String>) -> Self {
        Self {
            name: "groq",
            api_url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            api_key,
            model: model.unwrap_or_else(|| "llama-3.3-70b-versatile".to_string()),
            temperature: 0.0,
            timeout: Duration::from_secs(45),
        }
    }
}

/// OpenAI-compatible chat-completions provider. Sends the batch as one
/// structured request and expects a raw JSON array back, one object
/// per input, each tagged with the caller's correlation id.
pub struct ChatProvider {
    config: ChatProviderConfig,
    client: reqwest::Client,
}

impl ChatProvider {
    pub fn new(config: ChatProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building provider http client")?;
        Ok(Self { config, client })
    }
}

const BATCH_SYSTEM_PROMPT: &str =
    "You are a JSON machine. Return ONLY a raw JSON array. One object for each input item.";

fn truncated(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn build_batch_prompt(batch: &[AnalysisInput]) -> String {
    let items: Vec<Value> = batch
        .iter()
        .map(|input| {
            json!({
                "id_interno": input.correlation.to_string(),
                "texto": format!("{} {}", input.title, truncated(&input.body, 400)),
            })
        })
        .collect();

    format!(
        "Você é um especialista em licitações de uma distribuidora de medicamentos e \
         produtos hospitalares.\n\
         Analise os itens abaixo e retorne um JSON array.\n\
         Regras:\n\
         1. Prioridade: medicamentos e material hospitalar no MA, PI, PA.\n\
         2. Rejeite obras, serviços e estados do Sul/Sudeste.\n\
         3. Retorne os campos: id_interno, resumo, nota (0-100), risco.\n\n\
         DADOS: {}",
        Value::Array(items)
    )
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Wire shape of one analysis object. All keys are required; an entry
/// missing any of them fails the whole batch (no partial trust of a
/// malformed payload).
#[derive(Debug, Deserialize)]
struct WireAnalysis {
    id_interno: Value,
    resumo: String,
    nota: Value,
    risco: String,
}

fn wire_score(value: &Value) -> i32 {
    value
        .as_i64()
        .map(|n| n as i32)
        .or_else(|| value.as_f64().map(|f| f.round() as i32))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(0)
        .clamp(0, 100)
}

fn wire_correlation(value: &Value) -> Option<CorrelationId> {
    match value {
        Value::String(s) => CorrelationId::parse(s),
        _ => None,
    }
}

/// Parses the model's reply into analyses. Markdown fences are
/// tolerated; anything that is not a JSON array of complete objects is
/// a contract violation. Entries whose correlation id does not parse
/// are dropped here and picked up by reconciliation.
fn parse_batch_reply(content: &str) -> Result<Vec<Analysis>, ProviderError> {
    let cleaned = content.replace("```json", "").replace("```", "");
    let wire: Vec<WireAnalysis> = serde_json::from_str(cleaned.trim())
        .map_err(|err| ProviderError::Contract(format!("reply is not an analysis array: {err}")))?;

    let mut out = Vec::with_capacity(wire.len());
    for entry in wire {
        let Some(correlation) = wire_correlation(&entry.id_interno) else {
            warn!(id = %entry.id_interno, "provider returned unknown correlation id; dropping entry");
            continue;
        };
        out.push(Analysis {
            correlation,
            summary: entry.resumo,
            score: wire_score(&entry.nota),
            risk: entry.risco,
        });
    }
    Ok(out)
}

#[async_trait]
impl AnalysisProvider for ChatProvider {
    fn name(&self) -> &'static str {
        self.config.name
    }

    async fn analyze(&self, batch: &[AnalysisInput]) -> Result<Vec<Analysis>, ProviderError> {
        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "system", "content": BATCH_SYSTEM_PROMPT},
                {"role": "user", "content": build_batch_prompt(batch)},
            ],
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Contract(format!("malformed completion payload: {err}")))?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ProviderError::Contract("completion has no choices".to_string()))?;

        parse_batch_reply(content)
    }
}

/// Deterministic keyword analyzer: the guaranteed last line of the
/// chain. Shares the filter engine's region vocabulary and applies a
/// hard geographic kill-switch before any scoring.
#[derive(Debug, Clone)]
pub struct RuleAnalyzer {
    leak_terms: Vec<String>,
    region_bonus_terms: Vec<String>,
    gold_terms: Vec<String>,
}

impl Default for RuleAnalyzer {
    fn default() -> Self {
        Self::from_vocabulary(&FilterVocabulary::default())
    }
}

impl RuleAnalyzer {
    pub fn from_vocabulary(vocabulary: &FilterVocabulary) -> Self {
        Self {
            leak_terms: vocabulary.region_leak_terms.clone(),
            region_bonus_terms: ["MARANH", "MA ", "PIAU", "PI ", "PARA ", "PA "]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            gold_terms: ["MEDICAMENT", "HOSPITALAR", "ODONTO", "FARMAC", "ENFERMAGEM"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }

    /// The geographic kill-switch. When it fires, its verdict stands
    /// even over a provider result for the same item.
    pub fn geo_reject(&self, input: &AnalysisInput) -> Option<Analysis> {
        let haystack = format!(" {} {} ", input.title, input.body).to_uppercase();
        let hit = self
            .leak_terms
            .iter()
            .find(|term| haystack.contains(term.as_str()))?;
        Some(Analysis {
            correlation: input.correlation,
            summary: format!("REJEITADO (GEO): texto menciona {}.", hit.trim()),
            score: 0,
            risk: "Fora da região alvo".to_string(),
        })
    }

    pub fn analyze_one(&self, input: &AnalysisInput) -> Analysis {
        if let Some(rejected) = self.geo_reject(input) {
            return rejected;
        }

        let haystack = format!(" {} {} ", input.title, input.body).to_uppercase();
        let mut score = 0;
        let mut risks: Vec<&str> = Vec::new();

        if self
            .region_bonus_terms
            .iter()
            .any(|t| haystack.contains(t.as_str()))
        {
            score += 40;
        }

        let summary = if self.gold_terms.iter().any(|t| haystack.contains(t.as_str())) {
            score += 50;
            "Edital compatível (termos-chave encontrados).".to_string()
        } else {
            risks.push("Não cita medicamentos explicitamente");
            "Texto genérico.".to_string()
        };

        Analysis {
            correlation: input.correlation,
            summary,
            score: score.min(100),
            risk: if risks.is_empty() {
                "Nenhum risco óbvio.".to_string()
            } else {
                risks.join(", ")
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnrichConfig {
    pub primary_api_key: Option<String>,
    pub primary_model: Option<String>,
    pub secondary_api_key: Option<String>,
    pub secondary_api_url: Option<String>,
    pub secondary_model: Option<String>,
    pub batch_size: usize,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self {
            primary_api_key: std::env::var("MTR_GROQ_API_KEY").ok().filter(|k| !k.is_empty()),
            primary_model: std::env::var("MTR_GROQ_MODEL").ok().filter(|m| !m.is_empty()),
            // The secondary slot ships disabled: it only exists when
            // explicitly configured.
            secondary_api_key: std::env::var("MTR_SECONDARY_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            secondary_api_url: std::env::var("MTR_SECONDARY_API_URL")
                .ok()
                .filter(|u| !u.is_empty()),
            secondary_model: std::env::var("MTR_SECONDARY_MODEL").ok().filter(|m| !m.is_empty()),
            batch_size: std::env::var("MTR_ENRICH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
        }
    }
}

/// The enrichment orchestrator. Tries each configured provider in
/// order, stops at the first whole-batch success, then reconciles item
/// by item so that every input ends up with exactly one analysis.
pub struct Enricher {
    providers: Vec<Box<dyn AnalysisProvider>>,
    fallback: RuleAnalyzer,
    batch_size: usize,
}

impl Enricher {
    pub fn new(
        providers: Vec<Box<dyn AnalysisProvider>>,
        fallback: RuleAnalyzer,
        batch_size: usize,
    ) -> Self {
        Self {
            providers,
            fallback,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &EnrichConfig, vocabulary: &FilterVocabulary) -> anyhow::Result<Self> {
        let mut providers: Vec<Box<dyn AnalysisProvider>> = Vec::new();

        if let Some(key) = &config.primary_api_key {
            providers.push(Box::new(ChatProvider::new(ChatProviderConfig::groq(
                key.clone(),
                config.primary_model.clone(),
            ))?));
        }
        if let (Some(key), Some(url)) = (&config.secondary_api_key, &config.secondary_api_url) {
            providers.push(Box::new(ChatProvider::new(ChatProviderConfig {
                name: "secondary",
                api_url: url.clone(),
                api_key: key.clone(),
                model: config
                    .secondary_model
                    .clone()
                    .unwrap_or_else(|| "gemini-1.5-flash-latest".to_string()),
                temperature: 0.0,
                timeout: Duration::from_secs(45),
            })?));
        }

        Ok(Self::new(
            providers,
            RuleAnalyzer::from_vocabulary(vocabulary),
            config.batch_size,
        ))
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Analyzes one batch. The returned vector always has exactly one
    /// entry per input, in input order.
    pub async fn enrich(&self, batch: &[AnalysisInput]) -> Vec<Analysis> {
        if batch.is_empty() {
            return Vec::new();
        }

        let mut provider_results = Vec::new();
        for provider in &self.providers {
            match provider.analyze(batch).await {
                Ok(results) => {
                    info!(provider = provider.name(), analyzed = results.len(), "provider answered");
                    provider_results = results;
                    break;
                }
                Err(err) => {
                    warn!(provider = provider.name(), error = %err, "provider failed; trying next strategy");
                }
            }
        }

        self.reconcile(batch, provider_results)
    }

    /// Guarantee step: look up the provider result per correlation id;
    /// anything the provider skipped or hallucinated away gets the
    /// deterministic fallback, and the geographic kill-switch beats
    /// the provider either way.
    fn reconcile(&self, batch: &[AnalysisInput], results: Vec<Analysis>) -> Vec<Analysis> {
        let mut by_correlation: HashMap<CorrelationId, Analysis> =
            results.into_iter().map(|a| (a.correlation, a)).collect();

        batch
            .iter()
            .map(|input| {
                if let Some(rejected) = self.fallback.geo_reject(input) {
                    return rejected;
                }
                match by_correlation.remove(&input.correlation) {
                    Some(mut analysis) => {
                        analysis.score = analysis.score.clamp(0, 100);
                        analysis
                    }
                    None => {
                        warn!(correlation = %input.correlation, "item missing from provider reply; using fallback");
                        self.fallback.analyze_one(input)
                    }
                }
            })
            .collect()
    }

    /// Chunks a large set into fixed-size batches; a failure inside
    /// one batch never blocks the following ones.
    pub async fn enrich_all(&self, inputs: &[AnalysisInput]) -> Vec<Analysis> {
        let mut out = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(self.batch_size) {
            out.extend(self.enrich(chunk).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn input(correlation: CorrelationId, title: &str) -> AnalysisInput {
        AnalysisInput {
            correlation,
            title: title.to_string(),
            body: String::new(),
        }
    }

    fn correlations(n: usize) -> Vec<CorrelationId> {
        let run = Uuid::new_v4();
        (0..n).map(|i| CorrelationId::derive(run, "test", i)).collect()
    }

    /// Answers for a fixed subset of correlation ids, or fails.
    struct ScriptedProvider {
        answers: Vec<Analysis>,
        fail: bool,
        seen_batches: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedProvider {
        fn answering(answers: Vec<Analysis>) -> Self {
            Self {
                answers,
                fail: false,
                seen_batches: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing() -> Self {
            Self {
                answers: Vec::new(),
                fail: true,
                seen_batches: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl AnalysisProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn analyze(&self, batch: &[AnalysisInput]) -> Result<Vec<Analysis>, ProviderError> {
            self.seen_batches.lock().unwrap().push(batch.len());
            if self.fail {
                return Err(ProviderError::Status(500));
            }
            let wanted: Vec<CorrelationId> = batch.iter().map(|i| i.correlation).collect();
            Ok(self
                .answers
                .iter()
                .filter(|a| wanted.contains(&a.correlation))
                .cloned()
                .collect())
        }
    }

    fn analysis(correlation: CorrelationId, summary: &str, score: i32) -> Analysis {
        Analysis {
            correlation,
            summary: summary.to_string(),
            score,
            risk: "ok".to_string(),
        }
    }

    #[tokio::test]
    async fn every_input_receives_exactly_one_analysis() {
        let ids = correlations(5);
        // Provider only answers for three of five items.
        let provider = ScriptedProvider::answering(vec![
            analysis(ids[0], "llm", 80),
            analysis(ids[2], "llm", 70),
            analysis(ids[4], "llm", 60),
        ]);
        let enricher = Enricher::new(vec![Box::new(provider)], RuleAnalyzer::default(), 5);

        let batch: Vec<AnalysisInput> = ids
            .iter()
            .map(|c| input(*c, "Aquisição de medicamentos no Maranhão"))
            .collect();
        let results = enricher.enrich(&batch).await;

        assert_eq!(results.len(), batch.len());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.correlation, ids[i]);
        }
        assert_eq!(results[0].summary, "llm");
        assert_eq!(results[2].summary, "llm");
        // The two skipped items came from the deterministic fallback.
        assert_eq!(results[1].summary, "Edital compatível (termos-chave encontrados).");
        assert_eq!(results[3].summary, "Edital compatível (termos-chave encontrados).");
    }

    #[tokio::test]
    async fn total_provider_failure_falls_back_for_the_whole_batch() {
        let ids = correlations(3);
        let enricher = Enricher::new(
            vec![Box::new(ScriptedProvider::failing())],
            RuleAnalyzer::default(),
            5,
        );
        let batch: Vec<AnalysisInput> = ids
            .iter()
            .map(|c| input(*c, "Material hospitalar para o Piauí"))
            .collect();
        let results = enricher.enrich(&batch).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.score == 90));
    }

    #[tokio::test]
    async fn second_strategy_runs_when_the_first_fails() {
        let ids = correlations(1);
        let backup = ScriptedProvider::answering(vec![analysis(ids[0], "backup", 55)]);
        let enricher = Enricher::new(
            vec![Box::new(ScriptedProvider::failing()), Box::new(backup)],
            RuleAnalyzer::default(),
            5,
        );
        let results = enricher
            .enrich(&[input(ids[0], "Aquisição de medicamentos MA")])
            .await;
        assert_eq!(results[0].summary, "backup");
    }

    #[tokio::test]
    async fn geo_kill_switch_overrides_a_provider_verdict() {
        let ids = correlations(1);
        let provider = ScriptedProvider::answering(vec![analysis(ids[0], "llm says fine", 95)]);
        let enricher = Enricher::new(vec![Box::new(provider)], RuleAnalyzer::default(), 5);

        let mut leaked = input(ids[0], "Aquisição de medicamentos");
        leaked.body = "entrega em São Paulo".to_string();
        let results = enricher.enrich(&[leaked]).await;

        assert_eq!(results[0].score, 0);
        assert!(results[0].summary.starts_with("REJEITADO (GEO)"));
        assert_eq!(results[0].risk, "Fora da região alvo");
    }

    #[tokio::test]
    async fn large_sets_are_chunked_into_bounded_batches() {
        let ids = correlations(12);
        let provider = ScriptedProvider::answering(Vec::new());
        let seen = provider.seen_batches.clone();
        let enricher = Enricher::new(vec![Box::new(provider)], RuleAnalyzer::default(), 5);
        let inputs: Vec<AnalysisInput> = ids.iter().map(|c| input(*c, "texto")).collect();

        let results = enricher.enrich_all(&inputs).await;
        assert_eq!(results.len(), 12);
        assert_eq!(seen.lock().unwrap().clone(), vec![5, 5, 2]);
    }

    #[test]
    fn rule_analyzer_scores_region_and_gold_terms() {
        let analyzer = RuleAnalyzer::default();
        let ids = correlations(4);

        let both = analyzer.analyze_one(&input(ids[0], "Compra de medicamentos no Maranhão"));
        assert_eq!(both.score, 90);
        assert_eq!(both.risk, "Nenhum risco óbvio.");

        let gold_only = analyzer.analyze_one(&input(ids[1], "Compra de medicamentos"));
        assert_eq!(gold_only.score, 50);

        let generic = analyzer.analyze_one(&input(ids[2], "Aquisição de materiais diversos"));
        assert_eq!(generic.score, 0);
        assert_eq!(generic.summary, "Texto genérico.");
        assert_eq!(generic.risk, "Não cita medicamentos explicitamente");

        let leaked = analyzer.analyze_one(&input(ids[3], "Compra de medicamentos em Brasília"));
        assert_eq!(leaked.score, 0);
        assert!(leaked.summary.starts_with("REJEITADO (GEO)"));
    }

    #[test]
    fn batch_reply_parses_with_and_without_fences() {
        let ids = correlations(2);
        let raw = format!(
            r#"[{{"id_interno": "{}", "resumo": "ok", "nota": 75, "risco": "nenhum"}},
                {{"id_interno": "{}", "resumo": "ok2", "nota": "40", "risco": "marca"}}]"#,
            ids[0], ids[1]
        );
        let parsed = parse_batch_reply(&raw).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].score, 75);
        assert_eq!(parsed[1].score, 40);

        let fenced = format!("```json\n{raw}\n```");
        assert_eq!(parse_batch_reply(&fenced).unwrap().len(), 2);
    }

    #[test]
    fn malformed_replies_are_whole_batch_contract_violations() {
        // Not an array.
        assert!(matches!(
            parse_batch_reply(r#"{"resumo": "x"}"#),
            Err(ProviderError::Contract(_))
        ));
        // Missing a required key.
        assert!(matches!(
            parse_batch_reply(r#"[{"id_interno": "x", "resumo": "y"}]"#),
            Err(ProviderError::Contract(_))
        ));
        // Not JSON at all.
        assert!(matches!(
            parse_batch_reply("desculpe, não consegui analisar"),
            Err(ProviderError::Contract(_))
        ));
    }

    #[test]
    fn hallucinated_correlation_ids_are_dropped_not_fatal() {
        let raw = r#"[{"id_interno": "not-a-uuid", "resumo": "x", "nota": 10, "risco": "y"}]"#;
        let parsed = parse_batch_reply(raw).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn scores_coerce_and_clamp() {
        assert_eq!(wire_score(&json!(150)), 100);
        assert_eq!(wire_score(&json!(-5)), 0);
        assert_eq!(wire_score(&json!(62.4)), 62);
        assert_eq!(wire_score(&json!("88")), 88);
        assert_eq!(wire_score(&json!(null)), 0);
    }

    #[test]
    fn missing_keys_leave_provider_list_empty() {
        let config = EnrichConfig::default();
        let enricher = Enricher::from_config(&config, &FilterVocabulary::default()).unwrap();
        assert!(enricher.provider_names().is_empty());
    }
}

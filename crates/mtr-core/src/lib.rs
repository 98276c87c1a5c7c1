//! Core domain model and admission rules for MTR.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mtr-core";

/// Run-scoped correlation handle attached to every candidate of an
/// ingestion pass. Derived deterministically so that provider responses
/// can be matched back without string/number coercion games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn derive(run_id: Uuid, source_tag: &str, ordinal: usize) -> Self {
        let name = format!("{source_tag}:{ordinal}");
        Self(Uuid::new_v5(&run_id, name.as_bytes()))
    }

    pub fn parse(input: &str) -> Option<Self> {
        Uuid::parse_str(input.trim()).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenderIdError {
    #[error("tender id `{0}` does not have cnpj-year-sequence segments")]
    MissingSegments(String),
    #[error("tender id `{0}` has a non-numeric sequence")]
    BadSequence(String),
}

/// External identity of a tender at the upstream source:
/// `<cnpj>-<year>-<sequence>`. Never mutated, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderId {
    pub cnpj: String,
    pub year: String,
    pub sequence: String,
}

impl TenderId {
    pub fn parse(raw: &str) -> Result<Self, TenderIdError> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() < 3 {
            return Err(TenderIdError::MissingSegments(raw.to_string()));
        }
        let id = Self {
            cnpj: parts[0].to_string(),
            year: parts[1].to_string(),
            sequence: parts[2].to_string(),
        };
        if id.sequence.parse::<u64>().is_err() {
            return Err(TenderIdError::BadSequence(raw.to_string()));
        }
        Ok(id)
    }

    /// Ordered, de-duplicated sequence spellings to probe upstream:
    /// bare integer, as-given, zero-padded to 5 and to 6 digits. The
    /// upstream pads inconsistently across API generations, so callers
    /// try these in order and stop at the first that yields items.
    pub fn sequence_variants(&self) -> impl Iterator<Item = String> {
        let bare = self
            .sequence
            .parse::<u64>()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| self.sequence.clone());
        let mut out: Vec<String> = Vec::with_capacity(4);
        for candidate in [
            bare,
            self.sequence.clone(),
            format!("{:0>5}", self.sequence),
            format!("{:0>6}", self.sequence),
        ] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out.into_iter()
    }

    /// Zero-padded spellings only, the order the legacy API accepts.
    pub fn padded_variants(&self) -> impl Iterator<Item = String> {
        let mut out: Vec<String> = Vec::with_capacity(2);
        for candidate in [
            format!("{:0>5}", self.sequence),
            format!("{:0>6}", self.sequence),
        ] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
        out.into_iter()
    }
}

impl fmt::Display for TenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.cnpj, self.year, self.sequence)
    }
}

/// Transient record emitted by a collector. Lives for one ingestion
/// pass only; persistence happens after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub correlation: CorrelationId,
    pub source: String,
    pub tender_id: String,
    pub title: String,
    pub organ_name: String,
    pub organ_cnpj: Option<String>,
    pub region_code: String,
    pub municipality: Option<String>,
    pub body: String,
    pub edital_link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub opens_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    #[serde(rename = "recebido")]
    Received,
    #[serde(rename = "aprovado")]
    Approved,
    #[serde(rename = "rejeitado")]
    Rejected,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "recebido",
            Self::Approved => "aprovado",
            Self::Rejected => "rejeitado",
        }
    }
}

impl FromStr for OpportunityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recebido" => Ok(Self::Received),
            "aprovado" => Ok(Self::Approved),
            "rejeitado" => Ok(Self::Rejected),
            other => Err(format!("unknown opportunity status `{other}`")),
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "alta")]
    Alta,
    #[serde(rename = "media")]
    Media,
    #[serde(rename = "baixa")]
    Baixa,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alta => "alta",
            Self::Media => "media",
            Self::Baixa => "baixa",
        }
    }

    pub fn from_score(score: i32) -> Self {
        if score >= 30 {
            Self::Alta
        } else if score >= 10 {
            Self::Media
        } else {
            Self::Baixa
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alta" => Ok(Self::Alta),
            "media" => Ok(Self::Media),
            "baixa" => Ok(Self::Baixa),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    OutsideTargetRegion,
    BlacklistMatch,
    NotInTargetDomain,
    SmallBusinessExclusive,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutsideTargetRegion => "outside target region",
            Self::BlacklistMatch => "blacklist match",
            Self::NotInTargetDomain => "not in target domain",
            Self::SmallBusinessExclusive => "small-business exclusive",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission verdict for one candidate. The score is computed even for
/// rejected records; downstream audit tooling reads it either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub status: OpportunityStatus,
    pub rejection_reason: Option<RejectionReason>,
    pub priority: Priority,
    pub score: i32,
    pub me_epp_exclusive: bool,
}

/// Persisted tender representation, the unit of business value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub tender_id: String,
    pub title: String,
    pub organ_name: String,
    pub organ_cnpj: Option<String>,
    pub region_code: String,
    pub municipality: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub opens_at: Option<DateTime<Utc>>,
    pub edital_link: String,
    pub category: Option<String>,
    pub status: OpportunityStatus,
    pub rejection_reason: Option<String>,
    pub me_epp_exclusive: bool,
    pub priority: Priority,
    pub score: i32,
    pub ai_summary: Option<String>,
    pub ai_risk: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Builds the persisted shape from a candidate plus its verdict.
    /// This is the only constructor the pipeline uses; the status set
    /// here is never changed by enrichment.
    pub fn from_candidate(candidate: &RawCandidate, verdict: &Classification, now: DateTime<Utc>) -> Self {
        Self {
            tender_id: candidate.tender_id.clone(),
            title: candidate.title.clone(),
            organ_name: candidate.organ_name.clone(),
            organ_cnpj: candidate.organ_cnpj.clone(),
            region_code: candidate.region_code.clone(),
            municipality: candidate.municipality.clone(),
            published_at: candidate.published_at,
            opens_at: candidate.opens_at,
            edital_link: candidate.edital_link.clone(),
            category: candidate.category.clone(),
            status: verdict.status,
            rejection_reason: verdict.rejection_reason.map(|r| r.to_string()),
            me_epp_exclusive: verdict.me_epp_exclusive,
            priority: verdict.priority,
            score: verdict.score,
            ai_summary: None,
            ai_risk: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single priced entry of a tender's bill of materials. Write-once:
/// the resolver never updates rows in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item_number: i32,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub unit_price: f64,
    pub provider_code: Option<String>,
}

/// Term lists driving the admission gates and the score. The defaults
/// are the production vocabulary; the pipeline may override them from
/// a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterVocabulary {
    pub allowed_regions: Vec<String>,
    pub region_leak_terms: Vec<String>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub high_value_terms: Vec<String>,
    pub medium_value_terms: Vec<String>,
}

fn owned(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| t.to_string()).collect()
}

impl Default for FilterVocabulary {
    fn default() -> Self {
        Self {
            allowed_regions: owned(&["MA", "PI", "PA"]),
            // Upper-cased, space-padded where the bare sigla would
            // otherwise match inside ordinary words.
            region_leak_terms: owned(&[
                "SÃO PAULO", " SP ", "RIO DE JANEIRO", " RJ ", "MINAS GERAIS", " MG ",
                "PARANÁ", " PR ", "SANTA CATARINA", " SC ", "BRASÍLIA", " DF ",
            ]),
            whitelist: owned(&[
                "medicament", "farmac", "hospital", "enfermagem", "saude", "odontol",
                "laborator", "cirurg", "ortoped", "fisioterap", "penso", "gaze",
                "luva", "seringa", "cateter", "agulha", "algodao", "infusao",
                "sonda", "curativo", "diagnostico", "reagente", "teste rapido",
                "equipamento medico", "material medico",
            ]),
            blacklist: owned(&[
                "obra", "engenharia", "transporte", "locação", "limpeza", "vigilância",
                "buffet", "alimentação", "merenda", "carro", "veículo", "automotivo",
                "peça", "pneu", "manutenção", "ar condicionado", "impressora",
                "cartucho", "papel", "expediente", "informática", "computador",
                "motorista", "copeira", "jardinagem", "dedetização", "internet",
                "telefonia", "segurança", "combustível", "lubrificante",
            ]),
            high_value_terms: owned(&[
                "medicament", "farmac", "hospital", "enfermagem", "cirurg",
                "ortoped", "fisioterap", "reagente", "equipamento medico",
            ]),
            medium_value_terms: owned(&[
                "luva", "seringa", "cateter", "agulha", "algodao", "gaze",
                "penso", "curativo", "material medico",
            ]),
        }
    }
}

/// Pure admission-control function. No I/O; the same candidate always
/// yields the same verdict for a given vocabulary.
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    vocabulary: FilterVocabulary,
}

impl FilterEngine {
    pub fn new(vocabulary: FilterVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &FilterVocabulary {
        &self.vocabulary
    }

    /// Applies the gates in order: geography (text leakage first, then
    /// the region code), blacklist, whitelist, ME/EPP exclusivity.
    /// First matching rule wins; the score is computed regardless of
    /// the admission outcome.
    pub fn classify(&self, candidate: &RawCandidate) -> Classification {
        let score = self.score(&candidate.title);
        let priority = Priority::from_score(score);
        let me_epp_exclusive = self.is_me_epp_exclusive(candidate);

        let rejection_reason = self
            .geographic_rejection(candidate)
            .or_else(|| self.semantic_rejection(&candidate.title))
            .or_else(|| me_epp_exclusive.then_some(RejectionReason::SmallBusinessExclusive));

        Classification {
            status: if rejection_reason.is_some() {
                OpportunityStatus::Rejected
            } else {
                OpportunityStatus::Received
            },
            rejection_reason,
            priority,
            score,
            me_epp_exclusive,
        }
    }

    fn geographic_rejection(&self, candidate: &RawCandidate) -> Option<RejectionReason> {
        // Text leakage beats the structured code: a record that talks
        // about a disallowed state is out even if its code looks fine.
        let haystack = format!(" {} {} ", candidate.title, candidate.body).to_uppercase();
        if self
            .vocabulary
            .region_leak_terms
            .iter()
            .any(|term| haystack.contains(term.as_str()))
        {
            return Some(RejectionReason::OutsideTargetRegion);
        }
        let code = candidate.region_code.to_uppercase();
        if !self.vocabulary.allowed_regions.iter().any(|r| *r == code) {
            return Some(RejectionReason::OutsideTargetRegion);
        }
        None
    }

    fn semantic_rejection(&self, title: &str) -> Option<RejectionReason> {
        let title = title.to_lowercase();
        // Blacklist always overrides incidental whitelist co-occurrence.
        if self.vocabulary.blacklist.iter().any(|t| title.contains(t.as_str())) {
            return Some(RejectionReason::BlacklistMatch);
        }
        if self.vocabulary.whitelist.iter().any(|t| title.contains(t.as_str())) {
            return None;
        }
        // Matching neither list is an exclusion, never a silent pass.
        Some(RejectionReason::NotInTargetDomain)
    }

    fn is_me_epp_exclusive(&self, candidate: &RawCandidate) -> bool {
        let text = format!("{} {}", candidate.title, candidate.body).to_lowercase();
        text.contains("exclusiv") && text.contains("epp")
    }

    fn score(&self, title: &str) -> i32 {
        let title = title.to_lowercase();
        let mut score = 0;
        for term in &self.vocabulary.high_value_terms {
            if title.contains(term.as_str()) {
                score += 30;
            }
        }
        for term in &self.vocabulary.medium_value_terms {
            if title.contains(term.as_str()) {
                score += 10;
            }
        }
        score.min(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, region: &str) -> RawCandidate {
        RawCandidate {
            correlation: CorrelationId::derive(Uuid::nil(), "test", 0),
            source: "test".into(),
            tender_id: "11222333000144-2025-7".into(),
            title: title.into(),
            organ_name: "Prefeitura de Teste".into(),
            organ_cnpj: None,
            region_code: region.into(),
            municipality: None,
            body: String::new(),
            edital_link: String::new(),
            published_at: None,
            opens_at: None,
            category: None,
        }
    }

    #[test]
    fn correlation_ids_are_deterministic_per_run() {
        let run = Uuid::new_v4();
        let a = CorrelationId::derive(run, "pncp", 3);
        let b = CorrelationId::derive(run, "pncp", 3);
        let c = CorrelationId::derive(run, "pncp", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tender_id_parses_three_segments() {
        let id = TenderId::parse("12345678000190-2025-94").unwrap();
        assert_eq!(id.cnpj, "12345678000190");
        assert_eq!(id.year, "2025");
        assert_eq!(id.sequence, "94");
        assert_eq!(id.to_string(), "12345678000190-2025-94");

        assert!(matches!(
            TenderId::parse("hash-abc123"),
            Err(TenderIdError::MissingSegments(_))
        ));
        assert!(matches!(
            TenderId::parse("123-2025-abc"),
            Err(TenderIdError::BadSequence(_))
        ));
    }

    #[test]
    fn sequence_variants_follow_probe_order() {
        let id = TenderId::parse("12345678000190-2025-94").unwrap();
        let variants: Vec<String> = id.sequence_variants().collect();
        assert_eq!(variants, vec!["94", "00094", "000094"]);

        // A pre-padded sequence keeps its as-given spelling distinct.
        let padded = TenderId::parse("12345678000190-2025-094").unwrap();
        let variants: Vec<String> = padded.sequence_variants().collect();
        assert_eq!(variants, vec!["94", "094", "00094", "000094"]);

        let legacy: Vec<String> = id.padded_variants().collect();
        assert_eq!(legacy, vec!["00094", "000094"]);
    }

    #[test]
    fn geographic_gate_rejects_codes_outside_allow_set() {
        let engine = FilterEngine::default();
        for code in ["SP", "RJ", "BR", ""] {
            let verdict = engine.classify(&candidate("Aquisição de medicamentos", code));
            assert_eq!(verdict.status, OpportunityStatus::Rejected);
            assert_eq!(verdict.rejection_reason, Some(RejectionReason::OutsideTargetRegion));
        }
        for code in ["MA", "PI", "PA", "ma"] {
            let verdict = engine.classify(&candidate("Aquisição de medicamentos", code));
            assert_eq!(verdict.status, OpportunityStatus::Received);
        }
    }

    #[test]
    fn text_level_region_leakage_beats_region_code() {
        let engine = FilterEngine::default();
        let mut leaked = candidate("Aquisição de medicamentos", "MA");
        leaked.body = "Entrega na capital de São Paulo".into();
        let verdict = engine.classify(&leaked);
        assert_eq!(verdict.status, OpportunityStatus::Rejected);
        assert_eq!(verdict.rejection_reason, Some(RejectionReason::OutsideTargetRegion));
    }

    #[test]
    fn blacklist_takes_precedence_over_whitelist() {
        let engine = FilterEngine::default();
        let verdict =
            engine.classify(&candidate("Contratação de serviço de limpeza hospitalar", "PA"));
        assert_eq!(verdict.status, OpportunityStatus::Rejected);
        assert_eq!(verdict.rejection_reason, Some(RejectionReason::BlacklistMatch));
    }

    #[test]
    fn unknown_domain_is_rejected_not_pending() {
        let engine = FilterEngine::default();
        let verdict = engine.classify(&candidate("Aquisição de canetas", "MA"));
        assert_eq!(verdict.status, OpportunityStatus::Rejected);
        assert_eq!(verdict.rejection_reason, Some(RejectionReason::NotInTargetDomain));
    }

    #[test]
    fn me_epp_exclusive_tender_is_gated_out() {
        let engine = FilterEngine::default();
        let mut exclusive = candidate("Aquisição de medicamentos", "MA");
        exclusive.body = "Participação exclusiva para ME/EPP conforme lei".into();
        let verdict = engine.classify(&exclusive);
        assert_eq!(verdict.status, OpportunityStatus::Rejected);
        assert_eq!(
            verdict.rejection_reason,
            Some(RejectionReason::SmallBusinessExclusive)
        );
        assert!(verdict.me_epp_exclusive);

        let open = engine.classify(&candidate("Licitação aberta para ampla concorrência de material medico", "MA"));
        assert!(!open.me_epp_exclusive);
    }

    #[test]
    fn score_is_clamped_and_banded() {
        let engine = FilterEngine::default();
        // Every high-value term at once still clamps at 100.
        let loaded = candidate(
            "medicamentos farmacia hospitalar enfermagem cirurgico ortopedico fisioterapia reagente equipamento medico",
            "MA",
        );
        let verdict = engine.classify(&loaded);
        assert_eq!(verdict.score, 100);
        assert_eq!(verdict.priority, Priority::Alta);

        let medium = engine.classify(&candidate("Aquisição de gaze", "MA"));
        assert_eq!(medium.score, 10);
        assert_eq!(medium.priority, Priority::Media);

        let low = engine.classify(&candidate("Aquisição de canetas", "MA"));
        assert_eq!(low.score, 0);
        assert_eq!(low.priority, Priority::Baixa);
    }

    #[test]
    fn rejected_records_still_carry_a_score() {
        let engine = FilterEngine::default();
        let verdict = engine.classify(&candidate("Aquisição de medicamentos", "SP"));
        assert_eq!(verdict.status, OpportunityStatus::Rejected);
        assert_eq!(verdict.score, 30);
        assert_eq!(verdict.priority, Priority::Alta);
    }

    #[test]
    fn surgical_gloves_scenario_is_received_with_positive_score() {
        let engine = FilterEngine::default();
        let verdict = engine.classify(&candidate("Aquisição de luvas cirúrgicas", "MA"));
        assert_eq!(verdict.status, OpportunityStatus::Received);
        assert!(verdict.score > 0);
        assert!(matches!(verdict.priority, Priority::Alta | Priority::Media));
    }
}

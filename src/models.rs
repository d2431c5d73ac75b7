//! Core data models for the valuation pipeline

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValuationError;

//
// ================= Enums =================
//

/// Classical valuation methods applied per fiscal period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValuationMethod {
    BookValue,
    RevenueMultiple,
    EbitMultiple,
    EbitdaMultiple,
    PeMultiple,
}

/// Business pattern classification produced by the remote analysis.
/// Drives how multiple fiscal periods are weighted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusinessPattern {
    Growth,
    Cyclical,
    Stable,
}

impl BusinessPattern {
    /// Default decay factor when the remote analysis does not supply one.
    /// Lower alpha concentrates weight on the most recent period.
    pub fn default_alpha(&self) -> f64 {
        match self {
            BusinessPattern::Growth => 0.3,
            BusinessPattern::Cyclical => 0.5,
            BusinessPattern::Stable => 0.8,
        }
    }
}

/// Lifecycle of a valuation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    CollectingInput,
    Submitting,
    AwaitingAnswers,
    SubmittingAnswers,
    Finalizing,
    Complete,
    Error,
}

//
// ================= Input =================
//

/// Parsed manual figures, all in the company's reporting currency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ManualFigures {
    pub revenue: f64,
    pub profit: f64,
    pub assets: f64,
    pub liabilities: f64,
}

/// Manual figures as entered in the form, before locale parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawManualFigures {
    pub revenue: String,
    pub profit: String,
    pub assets: String,
    pub liabilities: String,
}

impl RawManualFigures {
    /// Parse all four fields, reporting the first field that fails.
    pub fn parse(&self) -> Result<ManualFigures, ValuationError> {
        let field = |name: &str, value: &str| {
            parse_locale_number(value).ok_or_else(|| {
                ValuationError::InputValidation(format!(
                    "Field '{}' is not a valid number: '{}'",
                    name, value
                ))
            })
        };

        Ok(ManualFigures {
            revenue: field("revenue", &self.revenue)?,
            profit: field("profit", &self.profit)?,
            assets: field("assets", &self.assets)?,
            liabilities: field("liabilities", &self.liabilities)?,
        })
    }
}

/// Input for one valuation round. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ValuationInput {
    #[serde(rename_all = "camelCase")]
    Manual { figures: ManualFigures },
    #[serde(rename_all = "camelCase")]
    Document {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        mime_type: String,
    },
}

/// Parse a locale-formatted number ("350.000,50", "350,000.50", "350000.5").
///
/// Rules: whitespace and apostrophes are grouping only. When both '.' and ','
/// appear, the rightmost one is the decimal separator. A lone separator
/// followed by exactly three digits is treated as grouping unless it is the
/// only separator and has one or two trailing digits.
pub fn parse_locale_number(input: &str) -> Option<f64> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '_')
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            let (decimal, decimal_pos) = if d > c { ('.', d) } else { (',', c) };
            let mut out = String::with_capacity(cleaned.len());
            for (i, ch) in cleaned.char_indices() {
                match ch {
                    '.' | ',' if i == decimal_pos && ch == decimal => out.push('.'),
                    '.' | ',' => {}
                    other => out.push(other),
                }
            }
            out
        }
        (Some(pos), None) | (None, Some(pos)) => {
            let sep_count = cleaned.chars().filter(|c| *c == '.' || *c == ',').count();
            let trailing = cleaned.len() - pos - 1;
            if sep_count == 1 && trailing != 3 {
                // Single separator with a non-group-sized tail: decimal point.
                let mut out = cleaned.clone();
                out.replace_range(pos..pos + 1, ".");
                out
            } else {
                // Grouping separators only.
                cleaned.chars().filter(|c| *c != '.' && *c != ',').collect()
            }
        }
        (None, None) => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

//
// ================= Clarification =================
//

/// One clarifying question from the extraction round.
/// Produced only by the remote service; read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    pub id: String,
    pub category: String,
    pub question_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identified_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization_purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_location: Option<String>,
}

impl ClarificationQuestion {
    /// Key under which this question's answer is stored: "{category}_{id}".
    pub fn answer_key(&self) -> String {
        format!("{}_{}", self.category, self.id)
    }
}

/// Answers keyed by "{category}_{id}". Keys unique, insertion order
/// irrelevant; grows monotonically during a round except by explicit edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct AnswerSet(pub BTreeMap<String, String>);

impl AnswerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, answer: String) {
        self.0.insert(key, answer);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

//
// ================= Method Results =================
//

/// One method's raw equity-value estimate for a period.
/// A value of zero or below means "not applicable", not a real zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodResult {
    pub method: ValuationMethod,
    pub equity_value: f64,
}

impl MethodResult {
    pub fn is_usable(&self) -> bool {
        self.equity_value > 0.0
    }
}

/// One fiscal period's raw method outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodValuation {
    pub period_end: NaiveDate,
    pub method_results: Vec<MethodResult>,
}

//
// ================= Aggregation Output =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ValueRange {
    pub low: f64,
    pub high: f64,
}

/// Aggregated result for a single fiscal period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum PeriodOutcome {
    #[serde(rename_all = "camelCase")]
    Computed {
        period_end: NaiveDate,
        most_likely_value: f64,
        range: ValueRange,
        methods_used: usize,
        /// Methods shown in reports, capped by display configuration.
        /// Display only; never changes the numeric average.
        displayed_methods: Vec<ValuationMethod>,
        /// Set when book value is negative: flagged rather than folded
        /// numerically into the range.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        negative_substance_value: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    NotComputable { period_end: NaiveDate, reason: String },
}

impl PeriodOutcome {
    pub fn period_end(&self) -> NaiveDate {
        match self {
            PeriodOutcome::Computed { period_end, .. } => *period_end,
            PeriodOutcome::NotComputable { period_end, .. } => *period_end,
        }
    }

    pub fn most_likely_value(&self) -> Option<f64> {
        match self {
            PeriodOutcome::Computed {
                most_likely_value, ..
            } => Some(*most_likely_value),
            PeriodOutcome::NotComputable { .. } => None,
        }
    }
}

//
// ================= Weighting =================
//

/// How several fiscal periods were blended into one estimate.
/// Part of the output contract so a report can show its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightingProfile {
    pub business_pattern: BusinessPattern,
    pub alpha: f64,
    /// Ordered newest-period-first; sums to 1.
    pub weights: Vec<f64>,
    pub rationale: String,
}

//
// ================= Final Outcome =================
//

/// The final valuation artifact. Created once per completed session and
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValuationOutcome {
    pub most_likely_value: f64,
    pub range: ValueRange,
    pub methods_used_count: usize,
    pub per_period: Vec<PeriodOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighting: Option<WeightingProfile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

//
// ================= Display =================
//

impl fmt::Display for ValuationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValuationMethod::BookValue => "book_value",
            ValuationMethod::RevenueMultiple => "revenue_multiple",
            ValuationMethod::EbitMultiple => "ebit_multiple",
            ValuationMethod::EbitdaMultiple => "ebitda_multiple",
            ValuationMethod::PeMultiple => "pe_multiple",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for BusinessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusinessPattern::Growth => "growth",
            BusinessPattern::Cyclical => "cyclical",
            BusinessPattern::Stable => "stable",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::CollectingInput => "collecting_input",
            SessionState::Submitting => "submitting",
            SessionState::AwaitingAnswers => "awaiting_answers",
            SessionState::SubmittingAnswers => "submitting_answers",
            SessionState::Finalizing => "finalizing",
            SessionState::Complete => "complete",
            SessionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Serde Helpers =================
//

/// Document bytes travel as base64 strings on the wire.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

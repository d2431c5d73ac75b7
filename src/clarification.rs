//! Clarification round handling
//!
//! ClarificationGate interprets the first extraction round-trip and caches
//! the original input and question list for the second one.
//! AnswerCollector owns the evolving answer set for the current round.

use serde_json::Value;
use tracing::info;

use crate::error::{Result, ValuationError};
use crate::models::{AnswerSet, ClarificationQuestion, ValuationInput};
use crate::remote::{ExtractionResponse, FinancialAnalysis};

//
// ================= Gate =================
//

/// Routing decision for the extraction response.
#[derive(Debug)]
pub enum GateDecision {
    /// Clarifying questions are required; the gate now holds the round state.
    NeedsClarification,
    /// The service produced a completed analysis directly.
    Direct(Box<FinancialAnalysis>),
}

/// Holds the pending-questions state of one clarification round.
///
/// The remote service is stateless across rounds: the original input and the
/// question list must be re-submitted verbatim, so both are cached here
/// unchanged the moment the gate sees a clarification response.
#[derive(Debug, Default)]
pub struct ClarificationGate {
    cached_input: Option<ValuationInput>,
    questions: Vec<ClarificationQuestion>,
    raw_questions: Option<Value>,
    initial_findings: Option<Value>,
}

impl ClarificationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret the extraction response. A clarification response with a
    /// non-empty question list caches the round state; a direct analysis
    /// passes straight through without any state held here.
    pub fn evaluate(
        &mut self,
        input: &ValuationInput,
        response: ExtractionResponse,
    ) -> Result<GateDecision> {
        match response {
            ExtractionResponse::Clarification { questions, .. } if questions.is_empty() => {
                Err(ValuationError::RemoteCall(
                    "Extraction response requested user input without any questions".to_string(),
                ))
            }
            ExtractionResponse::Clarification {
                questions,
                raw_questions,
                initial_findings,
            } => {
                info!(
                    question_count = questions.len(),
                    "Clarification required before valuation"
                );

                self.cached_input = Some(input.clone());
                self.questions = questions;
                self.raw_questions = Some(raw_questions);
                self.initial_findings = initial_findings;

                Ok(GateDecision::NeedsClarification)
            }
            ExtractionResponse::Analysis(analysis) => {
                Ok(GateDecision::Direct(Box::new(analysis)))
            }
        }
    }

    pub fn questions(&self) -> &[ClarificationQuestion] {
        &self.questions
    }

    /// Question array exactly as received from the extraction call.
    pub fn raw_questions(&self) -> Option<&Value> {
        self.raw_questions.as_ref()
    }

    pub fn cached_input(&self) -> Option<&ValuationInput> {
        self.cached_input.as_ref()
    }

    pub fn initial_findings(&self) -> Option<&Value> {
        self.initial_findings.as_ref()
    }
}

//
// ================= Answer Collector =================
//

/// Per-category default answers for "skip all". Each template is an explicit
/// instruction not to normalize, so the remote valuation call never receives
/// a silently omitted category.
const CATEGORY_DEFAULTS: &[(&str, &str)] = &[
    (
        "owner_salary",
        "No information on a market-rate salary is available, use the figures as reported.",
    ),
    (
        "inventory",
        "Inventory is valued as reported, no adjustment required.",
    ),
    (
        "one_time_items",
        "Treat all items as recurring, no one-time adjustments.",
    ),
    (
        "rent",
        "Rent is at market rate, use the figures as reported.",
    ),
];

const GENERIC_DEFAULT: &str = "No further information available, use the figures as reported.";

/// Default answer text synthesized for a skipped category.
pub fn default_answer_for_category(category: &str) -> &'static str {
    CATEGORY_DEFAULTS
        .iter()
        .find(|(name, _)| *name == category)
        .map(|(_, template)| *template)
        .unwrap_or(GENERIC_DEFAULT)
}

/// Collects and validates user answers keyed by "{category}_{id}".
#[derive(Debug, Default, Clone)]
pub struct AnswerCollector {
    answers: AnswerSet,
}

impl AnswerCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore previously saved answers for the same valuation session.
    pub fn restore(answers: AnswerSet) -> Self {
        Self { answers }
    }

    /// Upsert one answer. Empty or whitespace-only text is rejected with a
    /// field-level error naming the offending key.
    pub fn set_answer(&mut self, question_id: &str, category: &str, text: &str) -> Result<()> {
        let key = format!("{}_{}", category, question_id);

        if text.trim().is_empty() {
            return Err(ValuationError::InputValidation(format!(
                "Answer for '{}' must not be empty",
                key
            )));
        }

        self.answers.insert(key, text.trim().to_string());
        Ok(())
    }

    /// True iff every question in the list has a non-empty trimmed entry.
    pub fn all_answered(&self, questions: &[ClarificationQuestion]) -> bool {
        questions.iter().all(|q| {
            self.answers
                .get(&q.answer_key())
                .map(|a| !a.trim().is_empty())
                .unwrap_or(false)
        })
    }

    /// Questions still lacking a usable answer.
    pub fn unanswered<'a>(
        &self,
        questions: &'a [ClarificationQuestion],
    ) -> Vec<&'a ClarificationQuestion> {
        questions
            .iter()
            .filter(|q| {
                self.answers
                    .get(&q.answer_key())
                    .map(|a| a.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Fill every unanswered question with its category default.
    /// Existing answers are left untouched.
    pub fn skip_all(&mut self, questions: &[ClarificationQuestion]) -> usize {
        let mut synthesized = 0;

        for question in questions {
            let key = question.answer_key();
            let needs_default = self
                .answers
                .get(&key)
                .map(|a| a.trim().is_empty())
                .unwrap_or(true);

            if needs_default {
                self.answers.insert(
                    key,
                    default_answer_for_category(&question.category).to_string(),
                );
                synthesized += 1;
            }
        }

        info!(synthesized, "Skip-all synthesized default answers");
        synthesized
    }

    pub fn answers(&self) -> &AnswerSet {
        &self.answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(id: &str, category: &str) -> ClarificationQuestion {
        ClarificationQuestion {
            id: id.to_string(),
            category: category.to_string(),
            question_text: format!("Question {}", id),
            identified_value: None,
            normalization_purpose: None,
            impact: None,
            source_location: None,
        }
    }

    fn manual_input() -> ValuationInput {
        ValuationInput::Manual {
            figures: crate::models::ManualFigures {
                revenue: 350_000.0,
                profit: 45_000.0,
                assets: 120_000.0,
                liabilities: 70_000.0,
            },
        }
    }

    #[test]
    fn test_gate_caches_round_state_on_clarification() {
        let mut gate = ClarificationGate::new();
        let raw = json!([{"id": "q1", "category": "owner_salary", "questionText": "?"}]);

        let response = ExtractionResponse::Clarification {
            questions: vec![question("q1", "owner_salary")],
            raw_questions: raw.clone(),
            initial_findings: None,
        };

        let decision = gate.evaluate(&manual_input(), response).unwrap();
        assert!(matches!(decision, GateDecision::NeedsClarification));
        assert_eq!(gate.questions().len(), 1);
        assert_eq!(gate.raw_questions(), Some(&raw));
        assert_eq!(gate.cached_input(), Some(&manual_input()));
    }

    #[test]
    fn test_gate_passes_direct_analysis_through() {
        let mut gate = ClarificationGate::new();
        let analysis = FinancialAnalysis {
            periods: vec![],
            business_pattern: crate::models::BusinessPattern::Stable,
            alpha: None,
            key_findings: vec![],
            recommendations: vec![],
        };

        let decision = gate
            .evaluate(&manual_input(), ExtractionResponse::Analysis(analysis))
            .unwrap();
        assert!(matches!(decision, GateDecision::Direct(_)));
        assert!(gate.cached_input().is_none());
    }

    #[test]
    fn test_gate_rejects_empty_question_list() {
        let mut gate = ClarificationGate::new();
        let response = ExtractionResponse::Clarification {
            questions: vec![],
            raw_questions: json!([]),
            initial_findings: None,
        };

        assert!(gate.evaluate(&manual_input(), response).is_err());
    }

    #[test]
    fn test_set_answer_rejects_whitespace() {
        let mut collector = AnswerCollector::new();
        let err = collector.set_answer("q1", "owner_salary", "   ").unwrap_err();
        assert!(err.to_string().contains("owner_salary_q1"));
        assert!(collector.answers().is_empty());
    }

    #[test]
    fn test_set_answer_upserts() {
        let mut collector = AnswerCollector::new();
        collector.set_answer("q1", "rent", "first").unwrap();
        collector.set_answer("q1", "rent", "second").unwrap();

        assert_eq!(collector.answers().len(), 1);
        assert_eq!(collector.answers().get("rent_q1"), Some("second"));
    }

    #[test]
    fn test_all_answered() {
        let questions = vec![question("q1", "rent"), question("q2", "inventory")];
        let mut collector = AnswerCollector::new();

        assert!(!collector.all_answered(&questions));
        collector.set_answer("q1", "rent", "market rate").unwrap();
        assert!(!collector.all_answered(&questions));
        assert_eq!(collector.unanswered(&questions).len(), 1);

        collector.set_answer("q2", "inventory", "as reported").unwrap();
        assert!(collector.all_answered(&questions));
    }

    #[test]
    fn test_skip_all_synthesizes_category_defaults() {
        let questions = vec![question("q1", "owner_salary"), question("q2", "inventory")];
        let mut collector = AnswerCollector::new();

        let synthesized = collector.skip_all(&questions);

        assert_eq!(synthesized, 2);
        assert_eq!(
            collector.answers().get("owner_salary_q1"),
            Some(default_answer_for_category("owner_salary"))
        );
        assert_eq!(
            collector.answers().get("inventory_q2"),
            Some(default_answer_for_category("inventory"))
        );
        assert!(collector.all_answered(&questions));
    }

    #[test]
    fn test_skip_all_preserves_existing_answers() {
        let questions = vec![question("q1", "owner_salary"), question("q2", "rent")];
        let mut collector = AnswerCollector::new();
        collector
            .set_answer("q1", "owner_salary", "CEO takes 90k, market rate is 70k")
            .unwrap();

        let synthesized = collector.skip_all(&questions);

        assert_eq!(synthesized, 1);
        assert_eq!(
            collector.answers().get("owner_salary_q1"),
            Some("CEO takes 90k, market rate is 70k")
        );
    }

    #[test]
    fn test_unknown_category_gets_generic_default() {
        assert_eq!(default_answer_for_category("goodwill"), GENERIC_DEFAULT);
    }
}

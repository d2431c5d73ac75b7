//! Valuation session - drives the two-phase clarification workflow
//!
//! COLLECTING_INPUT → SUBMITTING → AWAITING_ANSWERS ⇄ SUBMITTING_ANSWERS
//! → FINALIZING → COMPLETE, with ERROR reachable from any non-terminal state.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate::ValuationMethodAggregator;
use crate::clarification::{AnswerCollector, ClarificationGate, GateDecision};
use crate::error::{Result, ValuationError};
use crate::models::{
    ClarificationQuestion, PeriodOutcome, RawManualFigures, SessionState, ValuationInput,
    ValuationOutcome, ValueRange,
};
use crate::progress::ProgressStore;
use crate::remote::{
    AnalysisBackend, ExtractionResponse, FinancialAnalysis, RemoteCallExecutor, RetryPolicy,
    FN_EXTRACT, FN_FINALIZE,
};
use crate::weighting::PeriodWeighter;

/// One valuation attempt for one company. Owns its answer set and cached
/// input exclusively; concurrent sessions are fully independent.
///
/// At most one remote call is in flight at any time - all mutating
/// operations take `&mut self`.
pub struct ValuationSession {
    session_id: Uuid,
    company_name: String,
    company_id: Option<Uuid>,
    state: SessionState,
    executor: RemoteCallExecutor,
    gate: ClarificationGate,
    collector: AnswerCollector,
    aggregator: ValuationMethodAggregator,
    weighter: PeriodWeighter,
    progress: Arc<dyn ProgressStore>,
    outcome: Option<ValuationOutcome>,
    error: Option<String>,
}

impl ValuationSession {
    pub fn new(
        company_name: impl Into<String>,
        backend: Arc<dyn AnalysisBackend>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            company_name: company_name.into(),
            company_id: None,
            state: SessionState::CollectingInput,
            executor: RemoteCallExecutor::new(backend),
            gate: ClarificationGate::new(),
            collector: AnswerCollector::new(),
            aggregator: ValuationMethodAggregator::new(),
            weighter: PeriodWeighter::new(),
            progress,
            outcome: None,
            error: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor.set_policy(policy);
        self
    }

    pub fn with_company_id(mut self, company_id: Uuid) -> Self {
        self.company_id = Some(company_id);
        self
    }

    /// Reuse a known session id so previously saved answers can be restored.
    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    //
    // ================= Read Surface =================
    //

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&ValuationOutcome> {
        self.outcome.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn questions(&self) -> &[ClarificationQuestion] {
        self.gate.questions()
    }

    //
    // ================= Transitions =================
    //

    /// Parse locale-formatted form fields and submit them as manual input.
    pub async fn submit_manual(&mut self, raw: &RawManualFigures) -> Result<SessionState> {
        let figures = raw.parse()?;
        self.submit(ValuationInput::Manual { figures }).await
    }

    /// Submit the valuation input and run the extraction round-trip.
    ///
    /// Input validation failures leave the session in CollectingInput;
    /// a remote failure after exhausted retries moves it to Error.
    pub async fn submit(&mut self, input: ValuationInput) -> Result<SessionState> {
        if self.state != SessionState::CollectingInput {
            return Err(ValuationError::InvalidTransition(format!(
                "submit() is only valid in collecting_input, session is {}",
                self.state
            )));
        }

        Self::validate_input(&input)?;

        self.state = SessionState::Submitting;
        info!(
            session_id = ?self.session_id,
            company = %self.company_name,
            "Submitting valuation input for extraction"
        );

        let payload = self.extraction_payload(&input);
        let response = match self.executor.invoke(FN_EXTRACT, payload).await {
            Ok(value) => value,
            Err(e) => return Err(self.fail(e)),
        };

        let extraction = match ExtractionResponse::parse(&response) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.fail(e)),
        };

        match self.gate.evaluate(&input, extraction) {
            Ok(GateDecision::NeedsClarification) => {
                self.restore_saved_answers().await;
                self.state = SessionState::AwaitingAnswers;
                Ok(self.state)
            }
            Ok(GateDecision::Direct(analysis)) => {
                self.state = SessionState::Finalizing;
                match self.build_outcome(*analysis) {
                    Ok(outcome) => {
                        self.outcome = Some(outcome);
                        self.state = SessionState::Complete;
                        Ok(self.state)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Record one answer. Valid only while answers are awaited; the answer
    /// is persisted so a reload can restore it.
    pub async fn answer(&mut self, question_id: &str, category: &str, text: &str) -> Result<()> {
        if self.state != SessionState::AwaitingAnswers {
            return Err(ValuationError::InvalidTransition(format!(
                "answer() is only valid in awaiting_answers, session is {}",
                self.state
            )));
        }

        self.collector.set_answer(question_id, category, text)?;
        self.save_answers().await;
        Ok(())
    }

    /// Fill every unanswered question with its category default so the
    /// remote call still receives explicit do-not-normalize instructions.
    pub async fn skip_all(&mut self) -> Result<usize> {
        if self.state != SessionState::AwaitingAnswers {
            return Err(ValuationError::InvalidTransition(format!(
                "skip_all() is only valid in awaiting_answers, session is {}",
                self.state
            )));
        }

        let synthesized = self.collector.skip_all(self.gate.questions());
        self.save_answers().await;
        Ok(synthesized)
    }

    /// Re-submit the cached input, the original questions verbatim and the
    /// full answer set, then aggregate and weight the per-period results.
    ///
    /// Idempotent once complete: returns the cached outcome without another
    /// remote call.
    pub async fn finalize(&mut self) -> Result<&ValuationOutcome> {
        if self.state == SessionState::Complete {
            // Outcome is immutable; a new session is needed to recompute.
            return Ok(self.outcome.as_ref().expect("complete session has outcome"));
        }

        if self.state != SessionState::AwaitingAnswers {
            return Err(ValuationError::InvalidTransition(format!(
                "finalize() is only valid in awaiting_answers, session is {}",
                self.state
            )));
        }

        let questions = self.gate.questions();
        if !self.collector.all_answered(questions) {
            let open: Vec<String> = self
                .collector
                .unanswered(questions)
                .iter()
                .map(|q| q.answer_key())
                .collect();
            return Err(ValuationError::ClarificationIncomplete(format!(
                "{} question(s) still unanswered: {}",
                open.len(),
                open.join(", ")
            )));
        }

        self.state = SessionState::SubmittingAnswers;
        info!(
            session_id = ?self.session_id,
            answers = self.collector.answers().len(),
            "Submitting clarification answers for final valuation"
        );

        let payload = match self.finalization_payload() {
            Ok(payload) => payload,
            Err(e) => return Err(self.fail(e)),
        };

        let response = match self.executor.invoke(FN_FINALIZE, payload).await {
            Ok(value) => value,
            Err(e) => return Err(self.fail(e)),
        };

        self.state = SessionState::Finalizing;

        let analysis = match Self::parse_final_analysis(&response) {
            Ok(analysis) => analysis,
            Err(e) => return Err(self.fail(e)),
        };

        match self.build_outcome(analysis) {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                self.state = SessionState::Complete;

                if let Err(e) = self.progress.clear_progress(self.session_id).await {
                    warn!(session_id = ?self.session_id, "Failed to clear saved answers: {}", e);
                }

                Ok(self.outcome.as_ref().expect("outcome just set"))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    //
    // ================= Internals =================
    //

    fn validate_input(input: &ValuationInput) -> Result<()> {
        match input {
            ValuationInput::Manual { figures } => {
                let fields = [
                    ("revenue", figures.revenue),
                    ("profit", figures.profit),
                    ("assets", figures.assets),
                    ("liabilities", figures.liabilities),
                ];
                for (name, value) in fields {
                    if !value.is_finite() {
                        return Err(ValuationError::InputValidation(format!(
                            "Field '{}' is not a finite number",
                            name
                        )));
                    }
                }
                Ok(())
            }
            ValuationInput::Document { data, mime_type } => {
                if data.is_empty() {
                    return Err(ValuationError::InputValidation(
                        "Uploaded document is empty".to_string(),
                    ));
                }
                if mime_type.trim().is_empty() {
                    return Err(ValuationError::InputValidation(
                        "Uploaded document has no MIME type".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Move to the terminal Error state, keeping the message for display.
    fn fail(&mut self, error: ValuationError) -> ValuationError {
        warn!(
            session_id = ?self.session_id,
            state = %self.state,
            "Session failed: {}", error
        );
        self.state = SessionState::Error;
        self.error = Some(error.to_string());
        error
    }

    fn input_fields(&self, input: &ValuationInput) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("companyName".to_string(), json!(self.company_name));
        if let Some(company_id) = self.company_id {
            fields.insert("companyId".to_string(), json!(company_id));
        }

        match input {
            ValuationInput::Manual { figures } => {
                fields.insert("manualFigures".to_string(), json!(figures));
            }
            ValuationInput::Document { data, mime_type } => {
                use base64::engine::general_purpose::STANDARD;
                use base64::Engine;
                fields.insert("fileBlob".to_string(), json!(STANDARD.encode(data)));
                fields.insert("mimeType".to_string(), json!(mime_type));
            }
        }

        fields
    }

    fn extraction_payload(&self, input: &ValuationInput) -> Value {
        Value::Object(self.input_fields(input))
    }

    fn finalization_payload(&self) -> Result<Value> {
        let input = self.gate.cached_input().ok_or_else(|| {
            ValuationError::InvalidTransition(
                "No cached input for the finalization round".to_string(),
            )
        })?;
        let raw_questions = self.gate.raw_questions().ok_or_else(|| {
            ValuationError::InvalidTransition(
                "No cached questions for the finalization round".to_string(),
            )
        })?;

        let mut fields = self.input_fields(input);
        fields.insert("answers".to_string(), json!(self.collector.answers()));
        // Re-sent exactly as received; the remote service must see the same
        // question identifiers back.
        fields.insert("originalQuestions".to_string(), raw_questions.clone());

        Ok(Value::Object(fields))
    }

    /// The finalization response is the analysis payload itself; tolerate a
    /// `financialAnalysis` wrapper for symmetry with the extraction call.
    fn parse_final_analysis(response: &Value) -> Result<FinancialAnalysis> {
        let payload = response.get("financialAnalysis").unwrap_or(response);
        serde_json::from_value(payload.clone()).map_err(|e| {
            ValuationError::Aggregation(format!("Malformed final analysis payload: {}", e))
        })
    }

    /// Run per-period aggregation and multi-period weighting over the
    /// validated remote results.
    fn build_outcome(&self, analysis: FinancialAnalysis) -> Result<ValuationOutcome> {
        let mut periods = analysis.validated_periods()?;
        // Newest period first; weighting indexes by period age.
        periods.sort_by(|a, b| b.period_end.cmp(&a.period_end));

        let per_period: Vec<PeriodOutcome> = periods
            .iter()
            .map(|p| self.aggregator.aggregate(p))
            .collect();

        let computable: Vec<&PeriodOutcome> = per_period
            .iter()
            .filter(|o| o.most_likely_value().is_some())
            .collect();

        if computable.is_empty() {
            return Err(ValuationError::Aggregation(
                "No valuation method produced a usable value in any period".to_string(),
            ));
        }

        let (most_likely_value, range, methods_used_count, weighting) = if computable.len() == 1
            && per_period.len() == 1
        {
            // Single period: no weighting step.
            match computable[0] {
                PeriodOutcome::Computed {
                    most_likely_value,
                    range,
                    methods_used,
                    ..
                } => (*most_likely_value, *range, *methods_used, None),
                PeriodOutcome::NotComputable { .. } => unreachable!("filtered above"),
            }
        } else {
            let blended =
                self.weighter
                    .blend(analysis.business_pattern, analysis.alpha, &per_period)?;

            // Blend the per-period ranges with the same weights.
            let mut low = 0.0;
            let mut high = 0.0;
            for (i, outcome) in per_period.iter().enumerate() {
                if let PeriodOutcome::Computed { range, .. } = outcome {
                    low += blended.profile.weights[i] * range.low;
                    high += blended.profile.weights[i] * range.high;
                }
            }

            // Report the method count of the most recent computable period.
            let methods_used = per_period
                .iter()
                .find_map(|o| match o {
                    PeriodOutcome::Computed { methods_used, .. } => Some(*methods_used),
                    PeriodOutcome::NotComputable { .. } => None,
                })
                .unwrap_or(0);

            (
                blended.value,
                ValueRange { low, high },
                methods_used,
                Some(blended.profile),
            )
        };

        debug!(
            session_id = ?self.session_id,
            most_likely_value,
            periods = per_period.len(),
            "Valuation outcome computed"
        );

        Ok(ValuationOutcome {
            most_likely_value,
            range,
            methods_used_count,
            per_period,
            weighting,
            key_findings: analysis.key_findings,
            recommendations: analysis.recommendations,
        })
    }

    async fn restore_saved_answers(&mut self) {
        match self.progress.load_progress(self.session_id).await {
            Ok(Some(saved)) => {
                debug!(
                    session_id = ?self.session_id,
                    answers = saved.len(),
                    "Restored saved clarification answers"
                );
                self.collector = AnswerCollector::restore(saved);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    session_id = ?self.session_id,
                    "Failed to load saved answers, starting empty: {}", e
                );
            }
        }
    }

    async fn save_answers(&self) {
        if let Err(e) = self
            .progress
            .save_progress(self.session_id, self.collector.answers())
            .await
        {
            warn!(
                session_id = ?self.session_id,
                "Failed to persist answers, they remain in the session: {}", e
            );
        }
    }
}

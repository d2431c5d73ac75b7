//! Remote analysis service client
//!
//! The language-model analysis service is a black box reached over HTTP.
//! All retry handling lives here; response shapes are parsed into a tagged
//! union at this boundary so untyped payloads never travel further inland.
//! Uses a long-lived reqwest::Client for connection pooling.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Result, ValuationError};
use crate::models::{
    BusinessPattern, ClarificationQuestion, MethodResult, PeriodValuation, ValuationMethod,
};

/// Named remote function for the first extraction round-trip.
pub const FN_EXTRACT: &str = "extract";
/// Named remote function for the answer-finalization round-trip.
pub const FN_FINALIZE: &str = "finalize";

//
// ================= Backend =================
//

/// Trait for the remote analysis transport (HTTP in production, scripted
/// responses in tests and the demo binary).
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    async fn call(&self, function: &str, payload: Value) -> Result<Value>;
}

/// HTTP backend calling the external analysis service (connection-pooled).
pub struct HttpAnalysisBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpAnalysisBackend {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn call(&self, function: &str, payload: Value) -> Result<Value> {
        if self.api_key.is_empty() {
            return Err(ValuationError::RemoteCall(
                "ANALYSIS_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/functions/{}", self.base_url, function);

        info!(function = %function, "Calling analysis service");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(function = %function, "Analysis request failed: {}", e);
                ValuationError::RemoteCall(format!("Analysis service error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(function = %function, %status, "Analysis service error response");
            return Err(ValuationError::RemoteCall(format!(
                "Analysis service returned {}: {}",
                status, error_text
            )));
        }

        let body: Value = response.json().await.map_err(|e| {
            error!("Failed to parse analysis response: {}", e);
            ValuationError::RemoteCall(format!("Invalid JSON response: {}", e))
        })?;

        Ok(body)
    }
}

//
// ================= Retry Executor =================
//

/// Bounded linear back-off for remote calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt (3 retries = 4 total attempts).
    pub max_retries: u32,
    /// Wait before retry n is `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Invokes a named remote function, retrying every backend error with
/// linear back-off. On final failure the last error propagates unchanged.
///
/// All errors are treated as transient. The source system never
/// distinguished retryable from non-retryable failures and that intent is
/// preserved here rather than guessed at.
pub struct RemoteCallExecutor {
    backend: Arc<dyn AnalysisBackend>,
    policy: RetryPolicy,
}

impl RemoteCallExecutor {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(backend: Arc<dyn AnalysisBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub async fn invoke(&self, function: &str, payload: Value) -> Result<Value> {
        let mut attempt: u32 = 0;

        loop {
            match self.backend.call(function, payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        warn!(
                            function = %function,
                            attempts = attempt,
                            "Remote call failed after exhausting retries: {}", e
                        );
                        return Err(e);
                    }

                    let delay = self.policy.base_delay * attempt;
                    warn!(
                        function = %function,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Remote call failed, retrying: {}", e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

//
// ================= Response Parsing =================
//

/// Wire shape of one analyzed fiscal period. Method results stay as raw
/// JSON until finalization validates their numeric fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawPeriodAnalysis {
    pub period_end: chrono::NaiveDate,
    pub method_results: Vec<Value>,
}

/// Final analysis payload from the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinancialAnalysis {
    pub periods: Vec<RawPeriodAnalysis>,
    pub business_pattern: BusinessPattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl FinancialAnalysis {
    /// Validate every method result's shape. Missing or non-numeric fields
    /// are a local validation failure, never silently defaulted.
    pub fn validated_periods(&self) -> Result<Vec<PeriodValuation>> {
        let mut periods = Vec::with_capacity(self.periods.len());

        for raw in &self.periods {
            let mut method_results = Vec::with_capacity(raw.method_results.len());

            for entry in &raw.method_results {
                let method: ValuationMethod = entry
                    .get("method")
                    .cloned()
                    .ok_or_else(|| {
                        ValuationError::Aggregation(format!(
                            "Period {}: method result missing 'method' field",
                            raw.period_end
                        ))
                    })
                    .and_then(|v| {
                        serde_json::from_value(v).map_err(|_| {
                            ValuationError::Aggregation(format!(
                                "Period {}: unknown valuation method in {}",
                                raw.period_end, entry
                            ))
                        })
                    })?;

                let equity_value = entry
                    .get("equityValue")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        ValuationError::Aggregation(format!(
                            "Period {}: method '{}' has a missing or non-numeric equityValue",
                            raw.period_end, method
                        ))
                    })?;

                method_results.push(MethodResult {
                    method,
                    equity_value,
                });
            }

            periods.push(PeriodValuation {
                period_end: raw.period_end,
                method_results,
            });
        }

        Ok(periods)
    }
}

/// Tagged union of the extraction round-trip outcome, discriminated on the
/// `requiresUserInput` boolean.
#[derive(Debug, Clone)]
pub enum ExtractionResponse {
    Clarification {
        questions: Vec<ClarificationQuestion>,
        /// The question array exactly as received. Re-sent verbatim in the
        /// finalization call; the remote service is stateless across rounds.
        raw_questions: Value,
        initial_findings: Option<Value>,
    },
    Analysis(FinancialAnalysis),
}

impl ExtractionResponse {
    pub fn parse(value: &Value) -> Result<Self> {
        let requires_input = value
            .get("requiresUserInput")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if requires_input {
            let raw_questions = value
                .get("financialQuestions")
                .cloned()
                .unwrap_or_else(|| Value::Array(vec![]));

            let questions: Vec<ClarificationQuestion> =
                serde_json::from_value(raw_questions.clone()).map_err(|e| {
                    ValuationError::RemoteCall(format!(
                        "Malformed financialQuestions in extraction response: {}",
                        e
                    ))
                })?;

            return Ok(ExtractionResponse::Clarification {
                questions,
                raw_questions,
                initial_findings: value.get("initialFindings").cloned(),
            });
        }

        let analysis = value.get("financialAnalysis").ok_or_else(|| {
            ValuationError::RemoteCall(
                "Extraction response carries neither questions nor an analysis".to_string(),
            )
        })?;

        let analysis: FinancialAnalysis =
            serde_json::from_value(analysis.clone()).map_err(|e| {
                ValuationError::RemoteCall(format!("Malformed financialAnalysis payload: {}", e))
            })?;

        Ok(ExtractionResponse::Analysis(analysis))
    }
}

//
// ================= Mock Backend =================
//

/// Scripted backend for development & testing.
/// Keeps the pipeline functional without the analysis service.
pub struct MockAnalysisBackend {
    responses: tokio::sync::Mutex<std::collections::VecDeque<std::result::Result<Value, String>>>,
    calls: tokio::sync::Mutex<Vec<(String, Value)>>,
}

impl MockAnalysisBackend {
    pub fn new() -> Self {
        Self {
            responses: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            calls: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn push_ok(&self, value: Value) {
        self.responses.lock().await.push_back(Ok(value));
    }

    pub async fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .await
            .push_back(Err(message.to_string()));
    }

    /// Recorded (function, payload) pairs, in call order.
    pub async fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }
}

impl Default for MockAnalysisBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisBackend for MockAnalysisBackend {
    async fn call(&self, function: &str, payload: Value) -> Result<Value> {
        self.calls
            .lock()
            .await
            .push((function.to_string(), payload));

        match self.responses.lock().await.pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(ValuationError::RemoteCall(message)),
            None => Err(ValuationError::RemoteCall(
                "Mock backend has no scripted response".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_invoke_succeeds_first_attempt() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.push_ok(json!({"ok": true})).await;

        let executor = RemoteCallExecutor::with_policy(backend, fast_policy());
        let result = executor.invoke(FN_EXTRACT, json!({})).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_invoke_recovers_after_transient_failures() {
        let backend = Arc::new(MockAnalysisBackend::new());
        backend.push_err("connection reset").await;
        backend.push_err("connection reset").await;
        backend.push_ok(json!({"ok": true})).await;

        let executor = RemoteCallExecutor::with_policy(backend, fast_policy());
        let result = executor.invoke(FN_EXTRACT, json!({})).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_propagates_last_error_after_four_attempts() {
        let backend = Arc::new(MockAnalysisBackend::new());
        for i in 1..=4 {
            backend.push_err(&format!("failure {}", i)).await;
        }

        let executor = RemoteCallExecutor::with_policy(backend, fast_policy());
        let start = Instant::now();
        let err = executor.invoke(FN_EXTRACT, json!({})).await.unwrap_err();

        // The last error, unchanged.
        assert!(err.to_string().contains("failure 4"));
        // Linear back-off: 1d + 2d + 3d = 60ms at d = 10ms.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_mock_records_payloads() {
        let backend = MockAnalysisBackend::new();
        backend.push_ok(json!({})).await;

        let payload = json!({"companyName": "Acme"});
        backend.call(FN_EXTRACT, payload.clone()).await.unwrap();

        let calls = backend.recorded_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, FN_EXTRACT);
        assert_eq!(calls[0].1, payload);
    }

    #[test]
    fn test_extraction_response_clarification_branch() {
        let value = json!({
            "requiresUserInput": true,
            "financialQuestions": [
                {
                    "id": "q1",
                    "category": "owner_salary",
                    "questionText": "Is the reported salary market-rate?",
                    "identifiedValue": "85000"
                }
            ],
            "initialFindings": {"revenue": 350000}
        });

        match ExtractionResponse::parse(&value).unwrap() {
            ExtractionResponse::Clarification {
                questions,
                raw_questions,
                initial_findings,
            } => {
                assert_eq!(questions.len(), 1);
                assert_eq!(questions[0].category, "owner_salary");
                assert_eq!(raw_questions, value["financialQuestions"]);
                assert!(initial_findings.is_some());
            }
            other => panic!("expected clarification, got {:?}", other),
        }
    }

    #[test]
    fn test_extraction_response_analysis_branch() {
        let value = json!({
            "financialAnalysis": {
                "periods": [
                    {
                        "periodEnd": "2023-12-31",
                        "methodResults": [
                            {"method": "book_value", "equityValue": 50000.0}
                        ]
                    }
                ],
                "businessPattern": "stable"
            }
        });

        match ExtractionResponse::parse(&value).unwrap() {
            ExtractionResponse::Analysis(analysis) => {
                assert_eq!(analysis.business_pattern, BusinessPattern::Stable);
                assert_eq!(analysis.periods.len(), 1);
            }
            other => panic!("expected analysis, got {:?}", other),
        }
    }

    #[test]
    fn test_extraction_response_rejects_unknown_shape() {
        let value = json!({"something": "else"});
        assert!(ExtractionResponse::parse(&value).is_err());
    }

    #[test]
    fn test_validated_periods_rejects_non_numeric_values() {
        let analysis = FinancialAnalysis {
            periods: vec![RawPeriodAnalysis {
                period_end: chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
                method_results: vec![json!({"method": "ebit_multiple", "equityValue": "lots"})],
            }],
            business_pattern: BusinessPattern::Growth,
            alpha: None,
            key_findings: vec![],
            recommendations: vec![],
        };

        let err = analysis.validated_periods().unwrap_err();
        assert!(matches!(err, ValuationError::Aggregation(_)));
    }

    #[test]
    fn test_validated_periods_keeps_negative_values_untouched() {
        // Negative values are valid wire data; exclusion happens during
        // aggregation, not parsing.
        let analysis = FinancialAnalysis {
            periods: vec![RawPeriodAnalysis {
                period_end: chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
                method_results: vec![json!({"method": "book_value", "equityValue": -12000.0})],
            }],
            business_pattern: BusinessPattern::Growth,
            alpha: None,
            key_findings: vec![],
            recommendations: vec![],
        };

        let periods = analysis.validated_periods().unwrap();
        assert_eq!(periods[0].method_results[0].equity_value, -12000.0);
    }
}

use serde_json::json;
use std::sync::Arc;
use tracing::info;
use valuation_engine::{
    models::{RawManualFigures, SessionState},
    progress::InMemoryProgressStore,
    remote::MockAnalysisBackend,
    session::ValuationSession,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Valuation engine demo starting");

    // Script the analysis backend: one clarification round, then the
    // finalized multi-period analysis.
    let backend = Arc::new(MockAnalysisBackend::new());
    backend
        .push_ok(json!({
            "requiresUserInput": true,
            "financialQuestions": [
                {
                    "id": "q1",
                    "category": "owner_salary",
                    "questionText": "Does the reported owner salary match market rate?"
                },
                {
                    "id": "q2",
                    "category": "one_time_items",
                    "questionText": "Were there any one-time expenses in 2023?"
                }
            ],
            "initialFindings": ["Owner salary looks below market rate"]
        }))
        .await;
    backend
        .push_ok(json!({
            "requiresUserInput": false,
            "financialAnalysis": {
                "periods": [
                    {
                        "periodEnd": "2023-12-31",
                        "methodResults": [
                            { "method": "book_value", "equityValue": 80000.0 },
                            { "method": "revenue_multiple", "equityValue": 260000.0 },
                            { "method": "ebitda_multiple", "equityValue": 200000.0 }
                        ]
                    },
                    {
                        "periodEnd": "2022-12-31",
                        "methodResults": [
                            { "method": "book_value", "equityValue": 70000.0 },
                            { "method": "revenue_multiple", "equityValue": 190000.0 }
                        ]
                    }
                ],
                "businessPattern": "growth",
                "keyFindings": ["Revenue grew 37% year over year"],
                "recommendations": ["Document the owner salary adjustment"]
            }
        }))
        .await;

    let progress = Arc::new(InMemoryProgressStore::new());
    let mut session =
        ValuationSession::new("Beispiel Bäckerei GmbH".to_string(), backend, progress);

    let figures = RawManualFigures {
        revenue: "850.000".to_string(),
        profit: "95.000,50".to_string(),
        assets: "420.000".to_string(),
        liabilities: "340.000".to_string(),
    };

    info!(session_id = ?session.session_id(), "Submitting manual figures");

    let state = session.submit_manual(&figures).await?;
    println!("\n=== CLARIFICATION ===");
    println!("State after submit: {}", state);
    for question in session.questions() {
        println!("  [{}] {}", question.category, question.question_text);
    }

    // Answer one question, let the default template cover the rest.
    session
        .answer("q1", "owner_salary", "Owner draws 45.000 below market rate")
        .await?;
    let synthesized = session.skip_all().await?;
    println!("Synthesized {} default answer(s)", synthesized);

    let outcome = session.finalize().await?;
    println!("\n=== VALUATION RESULT ===");
    println!("Most likely value: {:.0}", outcome.most_likely_value);
    println!(
        "Range: {:.0} – {:.0}",
        outcome.range.low, outcome.range.high
    );
    println!("Methods used: {}", outcome.methods_used_count);
    if let Some(weighting) = &outcome.weighting {
        println!("Weighting: {}", weighting.rationale);
    }
    println!("\nKey findings:");
    for (i, finding) in outcome.key_findings.iter().enumerate() {
        println!("  {}: {}", i + 1, finding);
    }

    assert_eq!(session.state(), SessionState::Complete);
    Ok(())
}

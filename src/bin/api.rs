use std::sync::Arc;
use tracing::info;
use valuation_engine::{
    api::{start_server, ApiState},
    progress::progress_store_from_env,
    remote::HttpAnalysisBackend,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let base_url = std::env::var("ANALYSIS_API_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:9000".to_string());
    let api_key = std::env::var("ANALYSIS_API_KEY").unwrap_or_else(|_| {
        eprintln!("⚠️  ANALYSIS_API_KEY not set in .env");
        eprintln!("📌 See .env.example for setup instructions");
        "mock_key".to_string()
    });

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Valuation Engine - API Server");
    info!("📍 Port: {}", api_port);
    info!("🔗 Analysis backend: {}", base_url);

    // Create components
    let backend = Arc::new(HttpAnalysisBackend::new(base_url, api_key));
    let progress = progress_store_from_env();
    let state = ApiState::new(backend, progress);

    info!("✅ Valuation engine initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(state, api_port).await?;

    Ok(())
}

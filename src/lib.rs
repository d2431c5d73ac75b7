//! Business Valuation Engine
//!
//! A production-grade valuation resolution pipeline that:
//! - Accepts manual financial figures or uploaded financial statements
//! - Runs a two-phase clarification workflow with the analysis backend
//! - Averages multiple valuation methods per fiscal period
//! - Blends periods with business-pattern decay weighting
//! - Persists in-progress clarification answers across reloads
//!
//! SESSION FLOW:
//! INPUT → SUBMIT → CLARIFY? → ANSWER/SKIP → FINALIZE → AGGREGATE → COMPLETE

pub mod aggregate;
pub mod api;
pub mod clarification;
pub mod error;
pub mod models;
pub mod progress;
pub mod remote;
pub mod session;
pub mod weighting;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use session::ValuationSession;

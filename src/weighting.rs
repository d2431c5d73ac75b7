//! Multi-period weighting
//!
//! Blends several fiscal periods' equity valuations into one estimate using
//! an exponential decay over period age, with the decay factor chosen by the
//! business pattern detected upstream. Pure and synchronous.

use tracing::debug;

use crate::error::{Result, ValuationError};
use crate::models::{BusinessPattern, PeriodOutcome, WeightingProfile};

/// Blended multi-period result together with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendedValuation {
    pub value: f64,
    pub profile: WeightingProfile,
}

/// Combines per-period outcomes (already reduced to one value per period)
/// into a single blended estimate. The business pattern classification comes
/// from the remote analysis; the weighter never infers it.
#[derive(Debug, Default, Clone)]
pub struct PeriodWeighter;

impl PeriodWeighter {
    pub fn new() -> Self {
        Self
    }

    /// Blend period outcomes ordered newest-period-first.
    ///
    /// Raw weight for period age `i` is `alpha^i`, normalized so the weights
    /// over computable periods sum to 1. Not-computable periods keep a zero
    /// weight and drop out of both numerator and denominator. Zero
    /// computable periods is a hard failure.
    pub fn blend(
        &self,
        pattern: BusinessPattern,
        alpha_override: Option<f64>,
        outcomes: &[PeriodOutcome],
    ) -> Result<BlendedValuation> {
        if outcomes.is_empty() {
            return Err(ValuationError::Aggregation(
                "No fiscal period available for weighting".to_string(),
            ));
        }

        let alpha = alpha_override
            .filter(|a| *a > 0.0 && *a <= 1.0)
            .unwrap_or_else(|| pattern.default_alpha());

        let computable: Vec<(usize, f64)> = outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.most_likely_value().map(|v| (i, v)))
            .collect();

        if computable.is_empty() {
            return Err(ValuationError::Aggregation(
                "No fiscal period produced a computable valuation".to_string(),
            ));
        }

        let mut weights = vec![0.0; outcomes.len()];

        if computable.len() == 1 {
            // A single period skips weighting entirely.
            let (index, value) = computable[0];
            weights[index] = 1.0;

            return Ok(BlendedValuation {
                value,
                profile: WeightingProfile {
                    business_pattern: pattern,
                    alpha,
                    weights,
                    rationale: format!(
                        "Single computable fiscal period; weighted at 100% ({} pattern)",
                        pattern
                    ),
                },
            });
        }

        let denominator: f64 = computable.iter().map(|(i, _)| alpha.powi(*i as i32)).sum();

        let mut value = 0.0;
        for (i, period_value) in &computable {
            let weight = alpha.powi(*i as i32) / denominator;
            weights[*i] = weight;
            value += weight * period_value;
        }

        debug!(
            pattern = %pattern,
            alpha,
            periods = outcomes.len(),
            computable = computable.len(),
            "Blended multi-period valuation"
        );

        let newest_weight = computable
            .first()
            .map(|(i, _)| weights[*i])
            .unwrap_or(0.0);

        let rationale = format!(
            "{} of {} fiscal periods weighted with decay alpha {:.2} ({} pattern); \
             the most recent computable period carries {:.0}% of the weight",
            computable.len(),
            outcomes.len(),
            alpha,
            pattern,
            newest_weight * 100.0
        );

        Ok(BlendedValuation {
            value,
            profile: WeightingProfile {
                business_pattern: pattern,
                alpha,
                weights,
                rationale,
            },
        })
    }
}

//! Multi-method value averaging
//!
//! Turns a period's raw method outputs into a usable subset and an average.
//! Pure and synchronous; no remote calls happen here.

use tracing::debug;

use crate::models::{MethodResult, PeriodOutcome, PeriodValuation, ValuationMethod, ValueRange};

/// Aggregator configuration.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Maximum number of methods listed for display. Display only; the
    /// numeric average always uses every usable method.
    pub display_cap: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { display_cap: 5 }
    }
}

/// Applies the exclusion rules and computes the averaged "most likely value"
/// plus a low/high range for one fiscal period.
#[derive(Debug, Default, Clone)]
pub struct ValuationMethodAggregator {
    config: AggregatorConfig,
}

impl ValuationMethodAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AggregatorConfig) -> Self {
        Self { config }
    }

    /// Aggregate one period. A method result is usable iff its value is
    /// strictly positive; zero or negative means "not computable for this
    /// period" and is excluded from the average, not clamped.
    pub fn aggregate(&self, period: &PeriodValuation) -> PeriodOutcome {
        let usable: Vec<&MethodResult> = period
            .method_results
            .iter()
            .filter(|r| r.is_usable())
            .collect();

        if usable.is_empty() {
            debug!(period_end = %period.period_end, "No usable valuation method for period");
            return PeriodOutcome::NotComputable {
                period_end: period.period_end,
                reason: "No valuation method produced a positive value".to_string(),
            };
        }

        let sum: f64 = usable.iter().map(|r| r.equity_value).sum();
        let most_likely_value = sum / usable.len() as f64;

        let smallest = usable
            .iter()
            .map(|r| r.equity_value)
            .fold(f64::INFINITY, f64::min);
        let high = usable
            .iter()
            .map(|r| r.equity_value)
            .fold(f64::NEG_INFINITY, f64::max);

        // Book value anchors the lower bound when it is usable. A negative
        // book value is flagged instead of entering the range numerically.
        let book_value = period
            .method_results
            .iter()
            .find(|r| r.method == ValuationMethod::BookValue)
            .map(|r| r.equity_value);

        let low = match book_value {
            Some(bv) if bv > 0.0 => bv.min(smallest),
            _ => smallest,
        };

        let negative_substance_value = book_value.filter(|bv| *bv < 0.0);

        // Highest-value methods win the display slots.
        let mut by_value: Vec<&MethodResult> = usable.clone();
        by_value.sort_by(|a, b| {
            b.equity_value
                .partial_cmp(&a.equity_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let displayed_methods: Vec<ValuationMethod> = by_value
            .iter()
            .take(self.config.display_cap)
            .map(|r| r.method)
            .collect();

        PeriodOutcome::Computed {
            period_end: period.period_end,
            most_likely_value,
            range: ValueRange { low, high },
            methods_used: usable.len(),
            displayed_methods,
            negative_substance_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn period(results: Vec<(ValuationMethod, f64)>) -> PeriodValuation {
        PeriodValuation {
            period_end: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            method_results: results
                .into_iter()
                .map(|(method, equity_value)| MethodResult {
                    method,
                    equity_value,
                })
                .collect(),
        }
    }

    #[test]
    fn test_non_positive_values_never_enter_the_average() {
        let aggregator = ValuationMethodAggregator::new();
        let outcome = aggregator.aggregate(&period(vec![
            (ValuationMethod::BookValue, 100_000.0),
            (ValuationMethod::RevenueMultiple, 200_000.0),
            (ValuationMethod::EbitMultiple, 0.0),
            (ValuationMethod::EbitdaMultiple, -50_000.0),
        ]));

        match outcome {
            PeriodOutcome::Computed {
                most_likely_value,
                methods_used,
                ..
            } => {
                assert_eq!(methods_used, 2);
                assert!((most_likely_value - 150_000.0).abs() < 1e-9);
            }
            other => panic!("expected computed outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_usable_methods_is_not_computable() {
        let aggregator = ValuationMethodAggregator::new();
        let outcome = aggregator.aggregate(&period(vec![
            (ValuationMethod::EbitMultiple, 0.0),
            (ValuationMethod::PeMultiple, -10_000.0),
        ]));

        assert!(matches!(outcome, PeriodOutcome::NotComputable { .. }));
        assert_eq!(outcome.most_likely_value(), None);
    }

    #[test]
    fn test_range_brackets_the_average() {
        let aggregator = ValuationMethodAggregator::new();
        let outcome = aggregator.aggregate(&period(vec![
            (ValuationMethod::BookValue, 80_000.0),
            (ValuationMethod::RevenueMultiple, 240_000.0),
            (ValuationMethod::PeMultiple, 160_000.0),
        ]));

        match outcome {
            PeriodOutcome::Computed {
                most_likely_value,
                range,
                ..
            } => {
                assert_eq!(range.low, 80_000.0);
                assert_eq!(range.high, 240_000.0);
                assert!(range.low <= most_likely_value && most_likely_value <= range.high);
            }
            other => panic!("expected computed outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_book_value_is_flagged_not_folded_in() {
        let aggregator = ValuationMethodAggregator::new();
        let outcome = aggregator.aggregate(&period(vec![
            (ValuationMethod::BookValue, -30_000.0),
            (ValuationMethod::EbitMultiple, 120_000.0),
        ]));

        match outcome {
            PeriodOutcome::Computed {
                range,
                negative_substance_value,
                methods_used,
                ..
            } => {
                assert_eq!(negative_substance_value, Some(-30_000.0));
                assert_eq!(methods_used, 1);
                assert_eq!(range.low, 120_000.0);
            }
            other => panic!("expected computed outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_display_cap_does_not_change_the_average() {
        let capped = ValuationMethodAggregator::with_config(AggregatorConfig { display_cap: 2 });
        let uncapped = ValuationMethodAggregator::new();

        let input = period(vec![
            (ValuationMethod::BookValue, 50_000.0),
            (ValuationMethod::RevenueMultiple, 300_000.0),
            (ValuationMethod::EbitMultiple, 200_000.0),
            (ValuationMethod::EbitdaMultiple, 220_000.0),
            (ValuationMethod::PeMultiple, 180_000.0),
        ]);

        let a = capped.aggregate(&input);
        let b = uncapped.aggregate(&input);

        match (a, b) {
            (
                PeriodOutcome::Computed {
                    most_likely_value: capped_value,
                    displayed_methods: capped_display,
                    methods_used: capped_used,
                    ..
                },
                PeriodOutcome::Computed {
                    most_likely_value: full_value,
                    displayed_methods: full_display,
                    ..
                },
            ) => {
                assert_eq!(capped_value, full_value);
                assert_eq!(capped_used, 5);
                assert_eq!(capped_display.len(), 2);
                assert_eq!(full_display.len(), 5);
                // Highest-value methods win the display slots.
                assert_eq!(
                    capped_display,
                    vec![
                        ValuationMethod::RevenueMultiple,
                        ValuationMethod::EbitdaMultiple
                    ]
                );
            }
            other => panic!("expected computed outcomes, got {:?}", other),
        }
    }
}

//! Proportional reduction of over-limit allocations.
//!
//! Rows are walked in the order given. Each non-zero row is scaled by
//! `entitlement / tally`, floored on its magnitude with the sign kept, and
//! the walk stops as soon as the deficit is gone. Rows after the stop point
//! stay untouched.

use serde::{Deserialize, Serialize};

/// One row's planned change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    /// Position in the input slice.
    pub index: usize,
    pub old_value: i64,
    pub new_value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionPlan {
    /// Σ|value| before reduction.
    pub prior_tally: i64,
    /// Entitlement the plan targets, clamped at zero.
    pub entitlement: i64,
    pub reductions: Vec<Reduction>,
}

impl ReductionPlan {
    pub fn is_empty(&self) -> bool {
        self.reductions.is_empty()
    }

    /// Total magnitude taken away.
    pub fn removed(&self) -> i64 {
        self.reductions
            .iter()
            .fold(0_i64, |acc, r| {
                acc.saturating_add(r.old_value.saturating_abs() - r.new_value.saturating_abs())
            })
    }

    /// Magnitude that had to go for the tally to fit.
    pub fn deficit(&self) -> i64 {
        (self.prior_tally - self.entitlement).max(0)
    }
}

/// Plan the reduction of `values` so that Σ|value| fits under `entitlement`.
///
/// Returns an empty plan when the values already fit.
pub fn plan_reduction(values: &[i64], entitlement: i64) -> ReductionPlan {
    let entitlement = entitlement.max(0);
    // exact even when Σ|value| exceeds i64
    let tally: i128 = values.iter().map(|v| i128::from(*v).abs()).sum();
    let mut plan = ReductionPlan {
        prior_tally: i64::try_from(tally).unwrap_or(i64::MAX),
        entitlement,
        reductions: Vec::new(),
    };
    if tally <= i128::from(entitlement) {
        return plan;
    }

    let mut remaining_deficit = tally - i128::from(entitlement);
    for (index, &value) in values.iter().enumerate() {
        if value != 0 {
            let magnitude = i128::from(value).abs();
            let reduced_magnitude = (magnitude * i128::from(entitlement)) / tally;
            // reduced_magnitude <= entitlement, so it fits
            let new_value = i64::try_from(reduced_magnitude).unwrap_or(entitlement) * value.signum();
            if new_value != value {
                plan.reductions.push(Reduction {
                    index,
                    old_value: value,
                    new_value,
                });
            }
            remaining_deficit -= magnitude - reduced_magnitude;
        }
        if remaining_deficit <= 0 {
            break;
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn opposite_signs_shrink_to_shared_coefficient() {
        // tally 20, entitlement 8, coefficient 0.4
        let plan = plan_reduction(&[-10, 10], 8);
        assert_eq!(
            plan.reductions,
            vec![
                Reduction {
                    index: 0,
                    old_value: -10,
                    new_value: -4
                },
                Reduction {
                    index: 1,
                    old_value: 10,
                    new_value: 4
                },
            ]
        );
        assert_eq!(plan.removed(), 12);
        assert_eq!(plan.deficit(), 12);
    }

    #[test]
    fn compliant_values_produce_empty_plan() {
        assert!(plan_reduction(&[3, -4], 7).is_empty());
        assert!(plan_reduction(&[], 0).is_empty());
    }

    #[test]
    fn walk_stops_once_deficit_is_covered() {
        // deficit 1 is covered by the first row alone
        let plan = plan_reduction(&[1, 100], 100);
        assert_eq!(plan.reductions.len(), 1);
        assert_eq!(plan.reductions[0].new_value, 0);
    }

    #[test]
    fn zero_rows_are_skipped() {
        let plan = plan_reduction(&[0, 10, 0, -10], 10);
        let touched: Vec<usize> = plan.reductions.iter().map(|r| r.index).collect();
        assert_eq!(touched, vec![1, 3]);
    }

    #[test]
    fn negative_entitlement_zeroes_everything() {
        let plan = plan_reduction(&[5, -5], -3);
        assert_eq!(plan.entitlement, 0);
        assert!(plan.reductions.iter().all(|r| r.new_value == 0));
        assert_eq!(plan.removed(), 10);
    }

    #[test]
    fn tally_beyond_i64_is_reduced_in_one_plan() {
        let plan = plan_reduction(&[i64::MAX - 1, -(i64::MAX - 1)], 10);
        assert_eq!(plan.prior_tally, i64::MAX);
        let after: Vec<i64> = plan.reductions.iter().map(|r| r.new_value).collect();
        assert_eq!(after, vec![5, -5]);
        // the removed magnitude itself saturates
        assert_eq!(plan.removed(), i64::MAX);
    }

    proptest! {
        #[test]
        fn reduction_converges(
            values in proptest::collection::vec(-1_000_000i64..1_000_000, 0..40),
            entitlement in 0i64..2_000_000,
        ) {
            let plan = plan_reduction(&values, entitlement);
            let mut after = values.clone();
            for r in &plan.reductions {
                prop_assert_eq!(after[r.index], r.old_value);
                prop_assert!(r.new_value.abs() <= r.old_value.abs());
                prop_assert!(r.new_value == 0 || r.new_value.signum() == r.old_value.signum());
                after[r.index] = r.new_value;
            }
            let tally_after: i64 = after.iter().map(|v| v.abs()).sum();
            prop_assert!(tally_after <= entitlement);

            if plan.prior_tally > entitlement {
                // removal covers the deficit, overshooting by less than one unit per touched row
                let removed = plan.removed();
                prop_assert!(removed >= plan.deficit());
                prop_assert!(removed <= plan.deficit() + plan.reductions.len() as i64);
            } else {
                prop_assert!(plan.is_empty());
            }
        }
    }
}

//! Filter-importance criteria for structured pruning.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneCriterion {
    /// Filters with the smallest L1 norm go first.
    L1Norm,
    /// Filters closest to the geometric median of their layer go first.
    Fpgm,
}

impl PruneCriterion {
    /// Name recorded as `pruner` in `prune.yml`.
    pub fn pruner_name(&self) -> &'static str {
        match self {
            PruneCriterion::L1Norm => "L1NormFilterPruner",
            PruneCriterion::Fpgm => "FPGMFilterPruner",
        }
    }

    pub fn from_pruner_name(name: &str) -> Option<Self> {
        match name {
            "L1NormFilterPruner" => Some(PruneCriterion::L1Norm),
            "FPGMFilterPruner" => Some(PruneCriterion::Fpgm),
            _ => None,
        }
    }

    /// Importance score per filter (leading-dimension slice). Higher is kept longer.
    pub fn importance(&self, weight: &ArrayD<f32>) -> Vec<f64> {
        let filters: Vec<Vec<f64>> = weight
            .axis_iter(Axis(0))
            .map(|f| f.iter().map(|&v| v as f64).collect())
            .collect();
        match self {
            PruneCriterion::L1Norm => filters
                .iter()
                .map(|f| f.iter().map(|v| v.abs()).sum())
                .collect(),
            PruneCriterion::Fpgm => filters
                .iter()
                .map(|a| {
                    filters
                        .iter()
                        .map(|b| {
                            a.iter()
                                .zip(b)
                                .map(|(x, y)| (x - y) * (x - y))
                                .sum::<f64>()
                                .sqrt()
                        })
                        .sum()
                })
                .collect(),
        }
    }
}

impl fmt::Display for PruneCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PruneCriterion::L1Norm => f.write_str("l1_norm"),
            PruneCriterion::Fpgm => f.write_str("fpgm"),
        }
    }
}

impl FromStr for PruneCriterion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1_norm" => Ok(PruneCriterion::L1Norm),
            "fpgm" => Ok(PruneCriterion::Fpgm),
            other => Err(ConfigError::UnsupportedCriterion {
                criterion: other.to_string(),
            }),
        }
    }
}

/// Indices of the `round(n * ratio)` least important filters, ascending. At least one
/// filter is always kept.
pub fn least_important(importance: &[f64], ratio: f64) -> Vec<usize> {
    let n = importance.len();
    if n == 0 || ratio <= 0.0 {
        return Vec::new();
    }
    let count = ((n as f64 * ratio).round() as usize).min(n - 1);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| importance[a].total_cmp(&importance[b]).then(a.cmp(&b)));
    let mut chosen: Vec<usize> = order.into_iter().take(count).collect();
    chosen.sort_unstable();
    chosen
}

/// Copy of `weight` with the listed filters zeroed.
pub fn zero_filters(weight: &ArrayD<f32>, filters: &[usize]) -> ArrayD<f32> {
    let mut out = weight.clone();
    for &i in filters {
        if i < out.len_of(Axis(0)) {
            out.index_axis_mut(Axis(0), i).fill(0.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_parse() {
        assert_eq!("l1_norm".parse::<PruneCriterion>().unwrap(), PruneCriterion::L1Norm);
        assert_eq!("fpgm".parse::<PruneCriterion>().unwrap(), PruneCriterion::Fpgm);
        assert!(matches!(
            "taylor".parse::<PruneCriterion>(),
            Err(ConfigError::UnsupportedCriterion { .. })
        ));
    }

    #[test]
    fn test_l1_importance() {
        let w = array![[1.0f32, -1.0], [0.1, 0.1], [3.0, 0.0]].into_dyn();
        let imp = PruneCriterion::L1Norm.importance(&w);
        assert_eq!(least_important(&imp, 0.34), vec![1]);
    }

    #[test]
    fn test_fpgm_prefers_median_filter() {
        // the middle filter sits at the geometric median
        let w = array![[0.0f32, 0.0], [1.0, 1.0], [2.0, 2.0]].into_dyn();
        let imp = PruneCriterion::Fpgm.importance(&w);
        assert_eq!(least_important(&imp, 0.34), vec![1]);
    }

    #[test]
    fn test_least_important_keeps_one() {
        assert_eq!(least_important(&[1.0, 2.0], 1.0), vec![0]);
        assert!(least_important(&[1.0, 2.0], 0.0).is_empty());
    }

    #[test]
    fn test_zero_filters() {
        let w = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let z = zero_filters(&w, &[1]);
        assert_eq!(z, array![[1.0f32, 2.0], [0.0, 0.0]].into_dyn());
    }

    #[test]
    fn test_pruner_names_roundtrip() {
        for c in [PruneCriterion::L1Norm, PruneCriterion::Fpgm] {
            assert_eq!(PruneCriterion::from_pruner_name(c.pruner_name()), Some(c));
        }
    }
}

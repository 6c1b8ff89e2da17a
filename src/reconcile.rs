//! Citation reconciliation.
//!
//! Merges the OpenAlex and iCite counts of one record into a single value
//! under a run-wide policy. The function is pure: the same two inputs and
//! policy always give the same output.
//!
//! Provenance only depends on which sources reported a count and whether
//! they agree. The policy decides the value when they disagree.

use crate::error::HarvestError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// How to pick the unified count when both sources report one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationPolicy {
    #[default]
    PreferOpenalex,
    PreferIcite,
    Max,
    Min,
    /// Mean of the two, rounded half up
    Reconcile,
}

impl CitationPolicy {
    pub const ALL: [CitationPolicy; 5] = [
        CitationPolicy::PreferOpenalex,
        CitationPolicy::PreferIcite,
        CitationPolicy::Max,
        CitationPolicy::Min,
        CitationPolicy::Reconcile,
    ];

    fn as_str(self) -> &'static str {
        match self {
            CitationPolicy::PreferOpenalex => "prefer_openalex",
            CitationPolicy::PreferIcite => "prefer_icite",
            CitationPolicy::Max => "max",
            CitationPolicy::Min => "min",
            CitationPolicy::Reconcile => "reconcile",
        }
    }
}

impl FromStr for CitationPolicy {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        CitationPolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| {
                HarvestError::Config(format!(
                    "Unknown citations policy '{}' (expected prefer_openalex, prefer_icite, max, min or reconcile)",
                    s
                ))
            })
    }
}

impl fmt::Display for CitationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which sources contributed to the unified count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    OpenalexOnly,
    IciteOnly,
    BothAgree,
    BothReconciled,
    Unavailable,
}

/// Outcome for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub unified: Option<u64>,
    pub provenance: Provenance,
    /// `|openalex - icite|` when both are present
    pub discrepancy: Option<u64>,
}

/// Both raw counts plus the reconciled outcome, keyed by record id in batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CitationRow {
    pub openalex: Option<u64>,
    pub icite: Option<u64>,
    pub reconciled: Reconciled,
}

/// Mean of two counts, rounding half up
fn mean_half_up(a: u64, b: u64) -> u64 {
    // (a + b + 1) / 2 without overflowing
    a / 2 + b / 2 + (a % 2 + b % 2 + 1) / 2
}

/// Reconcile one record's counts under `policy`.
pub fn reconcile(openalex: Option<u64>, icite: Option<u64>, policy: CitationPolicy) -> Reconciled {
    match (openalex, icite) {
        (None, None) => Reconciled {
            unified: None,
            provenance: Provenance::Unavailable,
            discrepancy: None,
        },
        (Some(oa), None) => Reconciled {
            unified: Some(oa),
            provenance: Provenance::OpenalexOnly,
            discrepancy: None,
        },
        (None, Some(ic)) => Reconciled {
            unified: Some(ic),
            provenance: Provenance::IciteOnly,
            discrepancy: None,
        },
        (Some(oa), Some(ic)) if oa == ic => Reconciled {
            unified: Some(oa),
            provenance: Provenance::BothAgree,
            discrepancy: Some(0),
        },
        (Some(oa), Some(ic)) => {
            let value = match policy {
                CitationPolicy::PreferOpenalex => oa,
                CitationPolicy::PreferIcite => ic,
                CitationPolicy::Max => oa.max(ic),
                CitationPolicy::Min => oa.min(ic),
                CitationPolicy::Reconcile => mean_half_up(oa, ic),
            };
            Reconciled {
                unified: Some(value),
                provenance: Provenance::BothReconciled,
                discrepancy: Some(oa.abs_diff(ic)),
            }
        }
    }
}

/// Reconcile every id reported by either source.
///
/// A source that was not queried passes an empty map; its counts are
/// treated as unavailable.
pub fn reconcile_batch(
    openalex: &HashMap<String, Option<u64>>,
    icite: &HashMap<String, Option<u64>>,
    policy: CitationPolicy,
) -> HashMap<String, CitationRow> {
    let ids: BTreeSet<&String> = openalex.keys().chain(icite.keys()).collect();

    ids.into_iter()
        .map(|id| {
            let oa = openalex.get(id).copied().flatten();
            let ic = icite.get(id).copied().flatten();
            let row = CitationRow {
                openalex: oa,
                icite: ic,
                reconciled: reconcile(oa, ic, policy),
            };
            (id.clone(), row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_policy_independent() {
        for policy in CitationPolicy::ALL {
            for value in [0, 1, 17, 10_000] {
                let r = reconcile(Some(value), Some(value), policy);
                assert_eq!(r.provenance, Provenance::BothAgree, "{policy}");
                assert_eq!(r.discrepancy, Some(0));
                assert_eq!(r.unified, Some(value));
            }
        }
    }

    #[test]
    fn test_max_policy() {
        let p = CitationPolicy::Max;
        assert_eq!(reconcile(Some(5), Some(15), p).unified, Some(15));
        assert_eq!(reconcile(Some(20), Some(3), p).unified, Some(20));
        assert_eq!(reconcile(Some(7), None, p).unified, Some(7));
        assert_eq!(reconcile(None, Some(9), p).unified, Some(9));
        assert_eq!(reconcile(None, None, p).unified, None);
    }

    #[test]
    fn test_min_policy() {
        let p = CitationPolicy::Min;
        assert_eq!(reconcile(Some(5), Some(15), p).unified, Some(5));
        assert_eq!(reconcile(None, Some(9), p).unified, Some(9));
    }

    #[test]
    fn test_prefer_policies() {
        let oa = reconcile(Some(5), Some(15), CitationPolicy::PreferOpenalex);
        assert_eq!(oa.unified, Some(5));
        assert_eq!(oa.provenance, Provenance::BothReconciled);

        let ic = reconcile(Some(5), Some(15), CitationPolicy::PreferIcite);
        assert_eq!(ic.unified, Some(15));

        let fallback = reconcile(None, Some(4), CitationPolicy::PreferOpenalex);
        assert_eq!(fallback.unified, Some(4));
        assert_eq!(fallback.provenance, Provenance::IciteOnly);
    }

    #[test]
    fn test_reconcile_rounds_half_up() {
        let p = CitationPolicy::Reconcile;
        assert_eq!(reconcile(Some(5), Some(15), p).unified, Some(10));
        assert_eq!(reconcile(Some(2), Some(3), p).unified, Some(3));
        assert_eq!(reconcile(Some(0), Some(1), p).unified, Some(1));
        assert_eq!(reconcile(Some(u64::MAX), Some(u64::MAX - 1), p).unified, Some(u64::MAX));
    }

    #[test]
    fn test_reconcile_stays_within_bounds() {
        let p = CitationPolicy::Reconcile;
        for a in 0..40u64 {
            for b in 0..40u64 {
                let r = reconcile(Some(a), Some(b), p);
                let unified = r.unified.expect("both present");
                assert!(unified >= a.min(b) && unified <= a.max(b));
                assert_eq!(r.discrepancy, Some(a.abs_diff(b)));
            }
        }
    }

    #[test]
    fn test_single_and_missing_sources() {
        let r = reconcile(Some(8), None, CitationPolicy::Reconcile);
        assert_eq!(r.unified, Some(8));
        assert_eq!(r.provenance, Provenance::OpenalexOnly);
        assert_eq!(r.discrepancy, None);

        let none = reconcile(None, None, CitationPolicy::Reconcile);
        assert_eq!(none.provenance, Provenance::Unavailable);
        assert_eq!(none.discrepancy, None);
    }

    #[test]
    fn test_reconcile_batch_union() {
        let openalex: HashMap<String, Option<u64>> =
            [("1".to_string(), Some(3)), ("2".to_string(), None)].into_iter().collect();
        let icite: HashMap<String, Option<u64>> =
            [("2".to_string(), Some(6)), ("3".to_string(), Some(1))].into_iter().collect();

        let rows = reconcile_batch(&openalex, &icite, CitationPolicy::Max);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows["1"].reconciled.provenance, Provenance::OpenalexOnly);
        assert_eq!(rows["2"].reconciled.provenance, Provenance::IciteOnly);
        assert_eq!(rows["2"].icite, Some(6));
        assert_eq!(rows["3"].reconciled.unified, Some(1));
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in CitationPolicy::ALL {
            assert_eq!(policy.to_string().parse::<CitationPolicy>().ok(), Some(policy));
        }
        assert!("average".parse::<CitationPolicy>().is_err());
        assert_eq!(
            serde_json::to_string(&Provenance::BothReconciled).expect("serialize"),
            "\"both_reconciled\""
        );
    }
}

use log::info;
use rand::Rng;

use crate::model::{Detection, Neighbor, SanityThresholds};

/// Symmetric percentage difference of two values. Not finite when both are
/// zero; callers treat that as beyond any tolerance.
pub fn percentage_difference(a: f64, b: f64) -> f64 {
    (a - b).abs() * 100.0 / ((a.abs() + b.abs()) / 2.0)
}

fn beyond(diff: f64, tolerance: i64) -> bool {
    !diff.is_finite() || diff > tolerance as f64
}

/// Gate a candidate/existing pair on flux, spatial extent and spectral
/// extent percentage differences. Short-circuits on the first failure;
/// a difference exactly equal to its tolerance passes.
///
/// Extent quads are `(max_a, max_b, min_a, min_b)`: the candidate and
/// existing values of the larger measure, then of the smaller one.
pub fn sanity_check(
    flux: (f64, f64),
    spatial_extent: (f64, f64, f64, f64),
    spectral_extent: (f64, f64, f64, f64),
    thresholds: &SanityThresholds,
) -> bool {
    let (f1, f2) = flux;
    let diff = percentage_difference(f1, f2);
    if beyond(diff, thresholds.flux) {
        info!(
            "var: {f1}, {f2}, flux {diff:.2}% > {}%",
            thresholds.flux
        );
        return false;
    }

    let (max1, max2, min1, min2) = spatial_extent;
    let max_diff = percentage_difference(max1, max2);
    let min_diff = percentage_difference(min1, min2);
    if beyond(max_diff, thresholds.spatial_extent.max) {
        info!(
            "var: ell_maj check: {max_diff:.2}% > {}%",
            thresholds.spatial_extent.max
        );
        return false;
    }
    if beyond(min_diff, thresholds.spatial_extent.min) {
        info!(
            "var: ell_min check: {min_diff:.2}% > {}%",
            thresholds.spatial_extent.min
        );
        return false;
    }

    let (max1, max2, min1, min2) = spectral_extent;
    let max_diff = percentage_difference(max1, max2);
    let min_diff = percentage_difference(min1, min2);
    if beyond(max_diff, thresholds.spectral_extent.max) {
        info!(
            "var: w20 check: {max_diff:.2}% > {}%",
            thresholds.spectral_extent.max
        );
        return false;
    }
    if beyond(min_diff, thresholds.spectral_extent.min) {
        info!(
            "var: w50 check: {min_diff:.2}% > {}%",
            thresholds.spectral_extent.min
        );
        return false;
    }

    true
}

/// Single-call randomness port for the equal-confidence tie-break, so tests
/// (and alternative policies) can force either branch.
pub trait TieBreak: Send {
    /// true replaces the existing detection with the candidate, false keeps
    /// the existing one.
    fn prefer_candidate(&mut self) -> bool;
}

/// Unweighted coin flip: the shipped tie-break policy for equal-confidence
/// duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoinFlip;

impl TieBreak for CoinFlip {
    fn prefer_candidate(&mut self) -> bool {
        rand::rng().random_bool(0.5)
    }
}

/// Fixed decision, mainly for tests.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub bool);

impl TieBreak for Fixed {
    fn prefer_candidate(&mut self) -> bool {
        self.0
    }
}

/// Decision for one candidate against its matched neighbors.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No neighbor contends: insert as a new detection.
    Insert { unresolved: bool },
    /// The candidate supersedes an existing detection; the replacement
    /// inherits the existing row's unresolved flag.
    Replace { existing_id: i64, unresolved: bool },
    /// The existing detection wins; the candidate is dropped.
    KeepExisting { existing_id: i64 },
    /// No neighbor reconciled automatically: insert the candidate as
    /// unresolved and flag every matched neighbor for manual review.
    Unresolved { neighbor_ids: Vec<i64> },
}

/// The per-candidate reconciliation state machine.
///
/// Neighbors are visited in the order given (ascending id); the first one
/// passing the sanity check settles the candidate. Flag 0 (high confidence)
/// always supersedes flag 4; equal flag classes fall to the tie-break.
pub fn resolve(
    candidate: &Detection,
    neighbors: &[Neighbor],
    thresholds: &SanityThresholds,
    tie: &mut dyn TieBreak,
) -> Resolution {
    if neighbors.is_empty() {
        return Resolution::Insert { unresolved: false };
    }

    for neighbor in neighbors {
        let passed = sanity_check(
            (candidate.f_sum, neighbor.f_sum),
            (
                candidate.ell_maj,
                neighbor.ell_maj,
                candidate.ell_min,
                neighbor.ell_min,
            ),
            (candidate.w20, neighbor.w20, candidate.w50, neighbor.w50),
            thresholds,
        );
        if !passed {
            continue;
        }

        return match (candidate.flag, neighbor.flag) {
            (0, 4) => Resolution::Replace {
                existing_id: neighbor.id,
                unresolved: neighbor.unresolved,
            },
            (a, b) if a == b => {
                if tie.prefer_candidate() {
                    Resolution::Replace {
                        existing_id: neighbor.id,
                        unresolved: neighbor.unresolved,
                    }
                } else {
                    Resolution::KeepExisting {
                        existing_id: neighbor.id,
                    }
                }
            }
            _ => Resolution::KeepExisting {
                existing_id: neighbor.id,
            },
        };
    }

    Resolution::Unresolved {
        neighbor_ids: neighbors.iter().map(|n| n.id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtentBounds;

    fn thresholds(flux: i64, spatial: i64, spectral: i64) -> SanityThresholds {
        SanityThresholds {
            flux,
            spatial_extent: ExtentBounds {
                min: spatial,
                max: spatial,
            },
            spectral_extent: ExtentBounds {
                min: spectral,
                max: spectral,
            },
            uncertainty_sigma: 5,
        }
    }

    fn candidate(flag: i32) -> Detection {
        Detection {
            name: "SoFiA J1000".into(),
            x: 10.0,
            y: 10.0,
            z: 10.0,
            f_sum: 100.0,
            ell_maj: 5.0,
            ell_min: 2.0,
            w20: 20.0,
            w50: 10.0,
            err_x: 0.1,
            err_y: 0.1,
            err_z: 0.1,
            flag,
            ..Detection::default()
        }
    }

    fn neighbor(id: i64, flag: i32) -> Neighbor {
        Neighbor {
            id,
            instance_id: 1,
            x: 10.01,
            y: 10.0,
            z: 10.0,
            f_sum: 100.0,
            ell_maj: 5.0,
            ell_min: 2.0,
            w50: 10.0,
            w20: 20.0,
            flag,
            unresolved: false,
        }
    }

    #[test]
    fn percentage_difference_is_symmetric() {
        assert_eq!(
            percentage_difference(100.0, 90.0),
            percentage_difference(90.0, 100.0)
        );
    }

    #[test]
    fn difference_equal_to_the_tolerance_passes() {
        // (100, 90) differ by 10.53%: beyond 10, within 11.
        let pair = (100.0, 90.0);
        let extent = (1.0, 1.0, 1.0, 1.0);
        assert!(sanity_check(pair, extent, extent, &thresholds(11, 5, 5)));
        assert!(!sanity_check(pair, extent, extent, &thresholds(10, 5, 5)));

        // (105, 95) differ by exactly 10%: only strictly-greater fails.
        assert!(sanity_check(
            (105.0, 95.0),
            extent,
            extent,
            &thresholds(10, 5, 5)
        ));
    }

    #[test]
    fn both_zero_extents_fail_the_check() {
        assert!(!sanity_check(
            (100.0, 100.0),
            (0.0, 0.0, 1.0, 1.0),
            (1.0, 1.0, 1.0, 1.0),
            &thresholds(5, 5, 5)
        ));
    }

    #[test]
    fn spatial_and_spectral_pairs_are_gated_separately() {
        let t = thresholds(50, 10, 10);
        // ell_maj out of tolerance
        assert!(!sanity_check(
            (100.0, 100.0),
            (10.0, 5.0, 2.0, 2.0),
            (1.0, 1.0, 1.0, 1.0),
            &t
        ));
        // w50 out of tolerance
        assert!(!sanity_check(
            (100.0, 100.0),
            (5.0, 5.0, 2.0, 2.0),
            (20.0, 20.0, 10.0, 5.0),
            &t
        ));
    }

    #[test]
    fn no_neighbors_inserts_resolved() {
        let res = resolve(&candidate(0), &[], &thresholds(5, 5, 5), &mut Fixed(true));
        assert_eq!(res, Resolution::Insert { unresolved: false });
    }

    #[test]
    fn high_confidence_always_supersedes_low() {
        // Regardless of the coin flip: run the scenario repeatedly.
        for _ in 0..100 {
            let res = resolve(
                &candidate(0),
                &[neighbor(7, 4)],
                &thresholds(5, 5, 5),
                &mut CoinFlip,
            );
            assert_eq!(
                res,
                Resolution::Replace {
                    existing_id: 7,
                    unresolved: false
                }
            );
        }
    }

    #[test]
    fn low_confidence_never_supersedes_high() {
        for _ in 0..100 {
            let res = resolve(
                &candidate(4),
                &[neighbor(7, 0)],
                &thresholds(5, 5, 5),
                &mut CoinFlip,
            );
            assert_eq!(res, Resolution::KeepExisting { existing_id: 7 });
        }
    }

    #[test]
    fn equal_flags_follow_the_tie_break() {
        let res = resolve(
            &candidate(0),
            &[neighbor(7, 0)],
            &thresholds(5, 5, 5),
            &mut Fixed(true),
        );
        assert_eq!(
            res,
            Resolution::Replace {
                existing_id: 7,
                unresolved: false
            }
        );

        let res = resolve(
            &candidate(4),
            &[neighbor(7, 4)],
            &thresholds(5, 5, 5),
            &mut Fixed(false),
        );
        assert_eq!(res, Resolution::KeepExisting { existing_id: 7 });
    }

    #[test]
    fn coin_flip_outcomes_are_roughly_balanced() {
        let trials = 2000;
        let mut replaced = 0;
        for _ in 0..trials {
            match resolve(
                &candidate(0),
                &[neighbor(7, 0)],
                &thresholds(5, 5, 5),
                &mut CoinFlip,
            ) {
                Resolution::Replace { .. } => replaced += 1,
                Resolution::KeepExisting { .. } => {}
                other => panic!("unexpected resolution {other:?}"),
            }
        }
        // Loose bound: ~13 sigma away from a fair coin.
        assert!(
            (700..=1300).contains(&replaced),
            "replaced {replaced} of {trials}"
        );
    }

    #[test]
    fn first_passing_neighbor_wins() {
        let res = resolve(
            &candidate(0),
            &[neighbor(3, 0), neighbor(9, 0)],
            &thresholds(5, 5, 5),
            &mut Fixed(true),
        );
        assert_eq!(
            res,
            Resolution::Replace {
                existing_id: 3,
                unresolved: false
            }
        );
    }

    #[test]
    fn failing_neighbors_are_skipped_without_side_effects() {
        let mut far = neighbor(3, 0);
        far.f_sum = 500.0;
        let res = resolve(
            &candidate(0),
            &[far, neighbor(9, 0)],
            &thresholds(5, 5, 5),
            &mut Fixed(true),
        );
        assert_eq!(
            res,
            Resolution::Replace {
                existing_id: 9,
                unresolved: false
            }
        );
    }

    #[test]
    fn exhausted_neighbors_mark_everything_unresolved() {
        let mut a = neighbor(3, 0);
        a.f_sum = 500.0;
        let mut b = neighbor(9, 0);
        b.f_sum = 700.0;
        let res = resolve(
            &candidate(0),
            &[a, b],
            &thresholds(5, 5, 5),
            &mut Fixed(true),
        );
        assert_eq!(
            res,
            Resolution::Unresolved {
                neighbor_ids: vec![3, 9]
            }
        );
    }

    #[test]
    fn replacement_inherits_the_unresolved_flag() {
        let mut n = neighbor(7, 4);
        n.unresolved = true;
        let res = resolve(&candidate(0), &[n], &thresholds(5, 5, 5), &mut Fixed(true));
        assert_eq!(
            res,
            Resolution::Replace {
                existing_id: 7,
                unresolved: true
            }
        );
    }
}

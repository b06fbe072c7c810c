pub mod merge;
pub mod reconcile;

pub use merge::{
    accepted_flag, merge_candidate, merge_instance, without_exact_position, CandidateOutcome,
    MergeOptions, MergeStats,
};
pub use reconcile::{
    percentage_difference, resolve, sanity_check, CoinFlip, Fixed, Resolution, TieBreak,
};

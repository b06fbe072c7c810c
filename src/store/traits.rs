use anyhow::Result;

use crate::model::{Detection, Neighbor, ProductSet};

/// Per-candidate catalog mutations, scoped to one open transaction.
///
/// The orchestrator drives the merge decision through this trait so the
/// state machine can be exercised against an in-memory double in tests; the
/// production implementation binds to a Postgres savepoint transaction.
#[async_trait::async_trait]
pub trait MergeStore: Send {
    /// Existing detections of the run within the uncertainty-scaled
    /// neighborhood of the candidate, in ascending id order. Every returned
    /// row is locked for the duration of the enclosing transaction.
    async fn matched_neighbors(
        &mut self,
        run_id: i64,
        candidate: &Detection,
        uncertainty_sigma: i64,
    ) -> Result<Vec<Neighbor>>;

    /// Insert a detection and its products; near-exact duplicates collapse
    /// onto the existing row. Returns the detection id.
    async fn insert_detection(
        &mut self,
        run_id: i64,
        instance_id: i64,
        detection: &Detection,
        products: &ProductSet,
        unresolved: bool,
    ) -> Result<i64>;

    async fn delete_detection(&mut self, detection_id: i64) -> Result<()>;

    /// Bulk-set the unresolved flag on the given detections.
    async fn flag_unresolved(&mut self, detection_ids: &[i64]) -> Result<()>;
}

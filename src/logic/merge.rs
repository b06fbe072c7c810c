use anyhow::{Context, Result};
use log::info;
use sqlx::Acquire;

use crate::error::TaskError;
use crate::logic::reconcile::{resolve, Resolution, TieBreak};
use crate::model::{Detection, Instance, Neighbor, ProductSet, Run};
use crate::sofia::{catalog, cubelets, OutputLayout};
use crate::store::postgres::{instance_upsert, run_lock, PgMergeTxn};
use crate::store::traits::MergeStore;
use crate::store::PostgresStore;

/// Per-instance merge options distilled from configuration.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// When false, candidates are imported directly without matching.
    pub perform_merge: bool,
    /// Candidates whose quality flag is outside this set are discarded
    /// before matching.
    pub quality_flags: Vec<i32>,
}

/// Tally of one instance merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub kept_existing: usize,
    pub unresolved: usize,
    pub skipped_flags: usize,
}

/// What became of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Inserted,
    Replaced,
    KeptExisting,
    Unresolved,
}

pub fn accepted_flag(flag: i32, accepted: &[i32]) -> bool {
    accepted.contains(&flag)
}

/// Discard matched rows at exactly the candidate's position: a re-run over
/// unchanged data must not reconcile a candidate against its own stored row.
pub fn without_exact_position(neighbors: Vec<Neighbor>, candidate: &Detection) -> Vec<Neighbor> {
    neighbors
        .into_iter()
        .filter(|n| !(n.x == candidate.x && n.y == candidate.y && n.z == candidate.z))
        .collect()
}

/// Run one candidate through match, reconcile and persist. The store is
/// expected to be scoped to this candidate's transaction.
pub async fn merge_candidate<S: MergeStore + ?Sized>(
    store: &mut S,
    run: &Run,
    instance_id: i64,
    candidate: &Detection,
    products: &ProductSet,
    perform_merge: bool,
    tie: &mut dyn TieBreak,
) -> Result<CandidateOutcome> {
    let run_id = run.id.context("run has not been registered")?;

    if !perform_merge {
        info!("not merging, direct import, name: {}", candidate.name);
        store
            .insert_detection(run_id, instance_id, candidate, products, false)
            .await?;
        return Ok(CandidateOutcome::Inserted);
    }

    let matched = store
        .matched_neighbors(run_id, candidate, run.sanity_thresholds.uncertainty_sigma)
        .await?;
    let neighbors = without_exact_position(matched, candidate);

    match resolve(candidate, &neighbors, &run.sanity_thresholds, tie) {
        Resolution::Insert { unresolved } => {
            info!("no duplicates, name: {}", candidate.name);
            store
                .insert_detection(run_id, instance_id, candidate, products, unresolved)
                .await?;
            Ok(CandidateOutcome::Inserted)
        }
        Resolution::Replace {
            existing_id,
            unresolved,
        } => {
            info!(
                "replacing detection {existing_id} with name: {}",
                candidate.name
            );
            store.delete_detection(existing_id).await?;
            store
                .insert_detection(run_id, instance_id, candidate, products, unresolved)
                .await?;
            Ok(CandidateOutcome::Replaced)
        }
        Resolution::KeepExisting { existing_id } => {
            info!(
                "keeping detection {existing_id} over name: {}",
                candidate.name
            );
            Ok(CandidateOutcome::KeptExisting)
        }
        Resolution::Unresolved { neighbor_ids } => {
            info!(
                "not resolved, name: {}, marking {} neighbor(s) unresolved",
                candidate.name,
                neighbor_ids.len()
            );
            store
                .insert_detection(run_id, instance_id, candidate, products, true)
                .await?;
            store.flag_unresolved(&neighbor_ids).await?;
            Ok(CandidateOutcome::Unresolved)
        }
    }
}

/// Merge one instance's catalog into the run.
///
/// Takes the exclusive run lock first, so at most one instance of a run is
/// merging at any time, also across OS processes. Each candidate then runs
/// in its own savepoint transaction inside the locked one; a crash leaves a
/// committed prefix that is safe to re-run.
pub async fn merge_instance(
    store: &PostgresStore,
    run: &Run,
    instance: &mut Instance,
    layout: &OutputLayout,
    options: &MergeOptions,
    tie: &mut dyn TieBreak,
) -> Result<MergeStats, TaskError> {
    let run_id = run
        .id
        .ok_or_else(|| TaskError::Store(anyhow::anyhow!("run has not been registered")))?;

    let catalog_path = layout.catalog_path();
    if !tokio::fs::try_exists(&catalog_path).await? {
        return Err(TaskError::MissingOutput(catalog_path));
    }
    let parsed = catalog::read_catalog(&catalog_path).await?;

    let plot_path = layout.reliability_plot_path();
    if !tokio::fs::try_exists(&plot_path).await? {
        return Err(TaskError::MissingOutput(plot_path));
    }

    instance.run_date = parsed.run_date;
    if parsed.version.is_some() {
        instance.version = parsed.version.clone();
    }
    instance.reliability_plot = Some(tokio::fs::read(&plot_path).await?);

    let mut stats = MergeStats::default();

    let mut tx = store.begin().await?;
    run_lock(&mut tx, run_id).await?;
    let instance_id = instance_upsert(&mut tx, instance).await?;
    instance.id = Some(instance_id);

    for source in &parsed.sources {
        if !accepted_flag(source.detection.flag, &options.quality_flags) {
            stats.skipped_flags += 1;
            continue;
        }

        let mut candidate = source.detection.clone();
        candidate.shift_to_cube(&instance.boundary);
        let products = cubelets::load_products(layout, source.id).await?;

        let mut sp = tx.begin().await.context("Failed to begin savepoint")?;
        let mut ops = PgMergeTxn::new(&mut sp, store.datalink_url());
        let outcome = merge_candidate(
            &mut ops,
            run,
            instance_id,
            &candidate,
            &products,
            options.perform_merge,
            tie,
        )
        .await?;
        sp.commit().await.context("Failed to commit candidate")?;

        match outcome {
            CandidateOutcome::Inserted => stats.inserted += 1,
            CandidateOutcome::Replaced => stats.replaced += 1,
            CandidateOutcome::KeptExisting => stats.kept_existing += 1,
            CandidateOutcome::Unresolved => stats.unresolved += 1,
        }
    }

    tx.commit().await.context("Failed to commit merge")?;
    Ok(stats)
}

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use log::{error, info};
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::error::TaskError;
use crate::logic::merge::{merge_instance, MergeOptions, MergeStats};
use crate::logic::reconcile::CoinFlip;
use crate::model::{Boundary, Instance, Run, SanityThresholds};
use crate::sofia::{exec, fits, OutputLayout, SofiaParams, NO_SOURCES_EXIT};
use crate::store::PostgresStore;

/// Clean result of one parameter-file task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Merged(MergeStats),
    /// The finder reported "no sources found"; nothing to merge.
    NoSources,
}

/// Drain the parameter-file queue with the configured number of worker
/// tasks. A failing task is logged and counted; its siblings keep going.
/// Errors out when any task failed, which turns into process exit code 1.
pub async fn run_all(
    store: Arc<PostgresStore>,
    config: Arc<AppConfig>,
    thresholds: SanityThresholds,
    param_files: Vec<PathBuf>,
) -> Result<()> {
    let queue = Arc::new(Mutex::new(VecDeque::from(param_files)));
    let failed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(config.sofia.processes);
    for worker_id in 0..config.sofia.processes {
        let store = store.clone();
        let config = config.clone();
        let thresholds = thresholds.clone();
        let queue = queue.clone();
        let failed = failed.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().pop_front();
                let Some(path) = next else {
                    break;
                };

                match process_param_file(&store, &config, &thresholds, &path).await {
                    Ok(TaskOutcome::Merged(stats)) => {
                        info!(
                            "worker {worker_id}: {} done: {} inserted, {} replaced, \
                             {} kept, {} unresolved, {} skipped by flag",
                            path.display(),
                            stats.inserted,
                            stats.replaced,
                            stats.kept_existing,
                            stats.unresolved,
                            stats.skipped_flags
                        );
                    }
                    Ok(TaskOutcome::NoSources) => {
                        info!("worker {worker_id}: {} found no sources", path.display());
                    }
                    Err(e) => {
                        error!("worker {worker_id}: {} failed: {e:#}", path.display());
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        if handle.await.is_err() {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let failed = failed.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{failed} parameter file task(s) failed");
    }
    Ok(())
}

/// One parameter file end to end: parse, register run and instance, run the
/// source finder when configured, then merge its catalog into the run.
pub async fn process_param_file(
    store: &PostgresStore,
    config: &AppConfig,
    thresholds: &SanityThresholds,
    param_path: &Path,
) -> Result<TaskOutcome, TaskError> {
    info!("*** processing {} ***", param_path.display());

    let params = SofiaParams::load(param_path).await?;
    let layout = OutputLayout::new(&params)?;
    let boundary = resolve_boundary(&params, param_path).await?;

    let mut run = Run::new(config.run.name.clone(), thresholds.clone());
    let run_id = store.upsert_run(&mut run).await?;

    // Placeholder row first; the final upsert carries the tool results.
    let mut instance = Instance::new(
        run_id,
        Utc::now().naive_utc(),
        layout.name.clone(),
        boundary,
        params.to_json(),
    );
    store.upsert_instance(&mut instance).await?;

    if config.sofia.execute {
        let sofia_path = config
            .sofia
            .path
            .as_deref()
            .ok_or_else(|| TaskError::params(param_path, "sofia.path is not configured"))?;

        tokio::fs::create_dir_all(&layout.output_dir).await?;
        if config.sofia.clean {
            exec::clean_previous_output(&layout).await?;
        }

        let output = exec::run_finder(sofia_path, &params.abs_path(), params.cwd()).await?;
        instance.return_code = output.return_code;
        instance.stdout = Some(output.stdout);
        instance.stderr = Some(output.stderr);
    }

    match instance.return_code {
        None | Some(0) => {
            let options = MergeOptions {
                perform_merge: config.run.perform_merge,
                quality_flags: config.run.quality_flags.clone(),
            };
            let stats = merge_instance(
                store,
                &run,
                &mut instance,
                &layout,
                &options,
                &mut CoinFlip,
            )
            .await?;
            Ok(TaskOutcome::Merged(stats))
        }
        Some(code) => {
            // Persist the failing execution before deciding what it means.
            store.upsert_instance(&mut instance).await?;
            error!("source finder completed with return code {code}");
            if let Some(stderr) = instance.stderr.as_deref().filter(|s| !s.is_empty()) {
                error!("{stderr}");
            }

            if code == NO_SOURCES_EXIT {
                Ok(TaskOutcome::NoSources)
            } else {
                Err(TaskError::FinderFailed { code })
            }
        }
    }
}

/// Boundary of the processed sub-region: the configured region when given,
/// otherwise the full cube from the input's FITS header.
async fn resolve_boundary(params: &SofiaParams, param_path: &Path) -> Result<Boundary, TaskError> {
    match params.region() {
        Some(region) => {
            Boundary::parse(region).map_err(|e| TaskError::params(param_path, e.to_string()))
        }
        None => {
            let input = params.input_data()?;
            let header = fits::primary_header(&input).await?;
            fits::cube_boundary(&input, &header)
        }
    }
}

use std::path::Path;

use log::info;
use tokio::process::Command;

use crate::error::TaskError;
use crate::sofia::OutputLayout;

/// Exit code the source finder uses for "no sources found"; a clean early
/// return, not a failure.
pub const NO_SOURCES_EXIT: i32 = 8;

/// Captured result of one source-finder execution.
#[derive(Debug, Clone)]
pub struct FinderOutput {
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run the source finder over one parameter file, with the parameter file's
/// directory as working directory.
pub async fn run_finder(
    executable: &Path,
    param_path: &Path,
    cwd: &Path,
) -> Result<FinderOutput, TaskError> {
    info!("executing source finder for {}", param_path.display());

    let tool_dir = executable.parent().unwrap_or_else(|| Path::new("."));
    let output = Command::new(executable)
        .arg(param_path)
        .current_dir(cwd)
        .env("SOFIA2_PATH", tool_dir)
        .output()
        .await?;

    Ok(FinderOutput {
        return_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Remove output of a previous execution: everything in the output directory
/// whose name starts with the output base name.
pub async fn clean_previous_output(layout: &OutputLayout) -> Result<(), TaskError> {
    let mut entries = match tokio::fs::read_dir(&layout.output_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&layout.name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }

    Ok(())
}

pub mod catalog;
pub mod cubelets;
pub mod exec;
pub mod fits;
pub mod params;

pub use catalog::{Catalog, SourceRecord};
pub use exec::{FinderOutput, NO_SOURCES_EXIT};
pub use params::SofiaParams;

use std::path::PathBuf;

use crate::error::TaskError;

/// Deterministic layout of the source finder's output files, keyed on the
/// output directory and output base name.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    pub name: String,
}

impl OutputLayout {
    pub fn new(params: &SofiaParams) -> Result<Self, TaskError> {
        Ok(Self {
            output_dir: params.output_directory()?,
            name: params.output_filename()?,
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_cat.xml", self.name))
    }

    pub fn reliability_plot_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}_rel.eps", self.name))
    }

    /// Per-source cubelet path prefix; companion files append a product
    /// suffix such as `_cube.fits` or `_spec.txt`.
    pub fn cubelet_base(&self, source_id: i64) -> PathBuf {
        self.output_dir
            .join(format!("{}_cubelets", self.name))
            .join(format!("{}_{}", self.name, source_id))
    }
}

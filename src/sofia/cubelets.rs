use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::TaskError;
use crate::model::ProductSet;
use crate::sofia::OutputLayout;

/// Read a companion file; a missing file yields empty bytes, not an error.
pub async fn read_optional(path: &Path) -> std::io::Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Load the binary products of one catalog source from its cubelet files.
pub async fn load_products(layout: &OutputLayout, source_id: i64) -> Result<ProductSet, TaskError> {
    let base = layout.cubelet_base(source_id);
    Ok(ProductSet {
        cube: Some(read_optional(&with_suffix(&base, "_cube.fits")).await?),
        mask: Some(read_optional(&with_suffix(&base, "_mask.fits")).await?),
        mom0: Some(read_optional(&with_suffix(&base, "_mom0.fits")).await?),
        mom1: Some(read_optional(&with_suffix(&base, "_mom1.fits")).await?),
        mom2: Some(read_optional(&with_suffix(&base, "_mom2.fits")).await?),
        // cubelet _chan.fits files were renamed _snr.fits in SoFiA-2 v2.3
        chan: Some(read_optional(&with_suffix(&base, "_snr.fits")).await?),
        spec: Some(read_optional(&with_suffix(&base, "_spec.txt")).await?),
        pv: Some(read_optional(&with_suffix(&base, "_pv.fits")).await?),
    })
}

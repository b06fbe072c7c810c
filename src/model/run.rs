use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Percentage tolerances for one extent axis: `min` gates the smaller pair
/// of the comparison (ell_min / w50), `max` the larger pair (ell_maj / w20).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentBounds {
    pub min: i64,
    pub max: i64,
}

/// Sanity thresholds of a run. Immutable for the lifetime of the run:
/// re-registering a run with the same name never rewrites the stored copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanityThresholds {
    pub flux: i64,
    pub spatial_extent: ExtentBounds,
    pub spectral_extent: ExtentBounds,
    pub uncertainty_sigma: i64,
}

impl SanityThresholds {
    /// Validate raw configuration values. Extent pairs are `[min, max]`.
    pub fn new(flux: i64, spatial: &[i64], spectral: &[i64], uncertainty_sigma: i64) -> Result<Self> {
        if flux <= 0 {
            bail!("flux sanity threshold must be a positive integer, got {flux}");
        }
        if uncertainty_sigma <= 0 {
            bail!("uncertainty_sigma must be a positive integer, got {uncertainty_sigma}");
        }
        let spatial_extent = extent_pair("spatial_extent", spatial)?;
        let spectral_extent = extent_pair("spectral_extent", spectral)?;
        Ok(Self {
            flux,
            spatial_extent,
            spectral_extent,
            uncertainty_sigma,
        })
    }
}

fn extent_pair(name: &str, values: &[i64]) -> Result<ExtentBounds> {
    match values {
        [min, max] => Ok(ExtentBounds {
            min: *min,
            max: *max,
        }),
        other => bail!(
            "{name} must be a two-element [min, max] pair, got {} element(s)",
            other.len()
        ),
    }
}

/// A named ingestion campaign. Created once per campaign, never deleted here.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Option<i64>,
    pub name: String,
    pub sanity_thresholds: SanityThresholds,
}

impl Run {
    pub fn new(name: impl Into<String>, sanity_thresholds: SanityThresholds) -> Self {
        Self {
            id: None,
            name: name.into(),
            sanity_thresholds,
        }
    }
}

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;

/// Sub-region of a cube: `[x_min, x_max, y_min, y_max, z_min, z_max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary(pub [i64; 6]);

impl Boundary {
    /// Parse a comma-separated `xmin,xmax,ymin,ymax,zmin,zmax` region string.
    pub fn parse(region: &str) -> Result<Self> {
        let values = region
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .with_context(|| format!("invalid region component {:?}", v.trim()))
            })
            .collect::<Result<Vec<_>>>()?;
        match <[i64; 6]>::try_from(values) {
            Ok(bounds) => Ok(Self(bounds)),
            Err(values) => bail!("region must have 6 components, got {}", values.len()),
        }
    }

    pub fn x_min(&self) -> i64 {
        self.0[0]
    }

    pub fn y_min(&self) -> i64 {
        self.0[2]
    }

    pub fn z_min(&self) -> i64 {
        self.0[4]
    }

    pub fn as_vec(&self) -> Vec<i64> {
        self.0.to_vec()
    }
}

/// One execution of the source finder over one sub-region of a run.
///
/// Upserted twice: first with placeholders before the tool runs, then with
/// the final results. Re-running overwrites the prior row rather than
/// duplicating it (unique on run, filename and boundary).
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: Option<i64>,
    pub run_id: i64,
    pub run_date: NaiveDateTime,
    pub filename: String,
    pub boundary: Boundary,
    pub flag_log: Option<Vec<u8>>,
    pub reliability_plot: Option<Vec<u8>>,
    pub log: Option<Vec<u8>>,
    pub parameters: serde_json::Value,
    pub version: Option<String>,
    pub return_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Instance {
    pub fn new(
        run_id: i64,
        run_date: NaiveDateTime,
        filename: impl Into<String>,
        boundary: Boundary,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            run_id,
            run_date,
            filename: filename.into(),
            boundary,
            flag_log: None,
            reliability_plot: None,
            log: None,
            parameters,
            version: None,
            return_code: None,
            stdout: None,
            stderr: None,
        }
    }
}

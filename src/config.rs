use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::model::SanityThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub run: RunConfig,
    pub sofia: SofiaConfig,
    /// Datalink base URL recorded on each detection's access_url; the new
    /// row id is appended. Optional.
    pub datalink_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub connection_string: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub schema: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the ingestion campaign all parameter files belong to.
    pub name: String,
    /// Flux percentage-difference tolerance.
    pub flux: i64,
    /// `[min, max]` percentage tolerances for ell_min/ell_maj.
    pub spatial_extent: Vec<i64>,
    /// `[min, max]` percentage tolerances for w50/w20.
    pub spectral_extent: Vec<i64>,
    /// Multiplier scaling the propagated-error neighborhood radius.
    pub uncertainty_sigma: i64,
    /// Quality flags a candidate must carry to be considered at all.
    pub quality_flags: Vec<i32>,
    /// When false, candidates are imported directly without matching.
    pub perform_merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SofiaConfig {
    /// Whether to invoke the source finder; when false, output files are
    /// expected to exist already.
    pub execute: bool,
    pub path: Option<PathBuf>,
    /// Remove output of previous executions before running.
    pub clean: bool,
    /// Number of concurrent worker tasks pulling parameter files.
    pub processes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            run: RunConfig::default(),
            sofia: SofiaConfig::default(),
            datalink_url: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            name: "sofiadb".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            schema: "public".to_string(),
            max_connections: 20,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            flux: 0,
            spatial_extent: Vec::new(),
            spectral_extent: Vec::new(),
            uncertainty_sigma: 5,
            quality_flags: vec![0, 4],
            perform_merge: true,
        }
    }
}

impl Default for SofiaConfig {
    fn default() -> Self {
        Self {
            execute: false,
            path: None,
            clean: false,
            processes: 1,
        }
    }
}

impl AppConfig {
    /// Load configuration from the given file plus `SOFIA_`-prefixed
    /// environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = config::Config::builder();

        // Add default configuration
        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::from(path));

        config = config.add_source(
            config::Environment::with_prefix("SOFIA")
                .separator("_")
                .prefix_separator("_"),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Eager validation of everything that must hold before any worker
    /// starts. Returns the validated sanity thresholds.
    pub fn validate(&self) -> Result<SanityThresholds> {
        if self.run.name.trim().is_empty() {
            bail!("run.name must be set");
        }
        if self.run.quality_flags.is_empty() {
            bail!("run.quality_flags must not be empty");
        }
        let thresholds = SanityThresholds::new(
            self.run.flux,
            &self.run.spatial_extent,
            &self.run.spectral_extent,
            self.run.uncertainty_sigma,
        )?;
        if self.sofia.execute && self.sofia.path.is_none() {
            bail!("sofia.path must be set when sofia.execute is enabled");
        }
        if self.sofia.processes == 0 {
            bail!("sofia.processes must be at least 1");
        }
        Ok(thresholds)
    }
}

impl DatabaseConfig {
    /// Connection string: explicit value, then the DATABASE_URL environment
    /// variable, then host/port/name credentials.
    pub fn url(&self) -> String {
        if let Some(connection_string) = &self.connection_string {
            return connection_string.clone();
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }

        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

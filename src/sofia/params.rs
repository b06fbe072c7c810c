use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::TaskError;

/// A parsed source-finder parameter file: sectionless `key = value` lines.
///
/// Keys are case-insensitive (stored lowercased). Relative paths in the file
/// resolve against the parameter file's directory.
#[derive(Debug, Clone)]
pub struct SofiaParams {
    pub path: PathBuf,
    cwd: PathBuf,
    values: BTreeMap<String, String>,
}

impl SofiaParams {
    pub async fn load(path: &Path) -> Result<Self, TaskError> {
        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Err(TaskError::params(path, "file is empty"));
        }
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, TaskError> {
        let mut values = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| TaskError::params(path, format!("malformed line {line:?}")))?;
            values.insert(key.trim().to_lowercase(), value.trim().to_string());
        }

        let abs = absolute(path);
        let cwd = abs
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            path: path.to_path_buf(),
            cwd,
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, TaskError> {
        self.get(key)
            .ok_or_else(|| TaskError::params(&self.path, format!("{key} is not defined")))
    }

    /// Directory the parameter file lives in; the finder runs with this cwd.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Absolute location of the parameter file itself.
    pub fn abs_path(&self) -> PathBuf {
        match self.path.file_name() {
            Some(name) => self.cwd.join(name),
            None => self.path.clone(),
        }
    }

    pub fn input_data(&self) -> Result<PathBuf, TaskError> {
        Ok(self.resolve(Path::new(self.require("input.data")?)))
    }

    pub fn output_directory(&self) -> Result<PathBuf, TaskError> {
        Ok(self.resolve(Path::new(self.require("output.directory")?)))
    }

    /// Output base name; defaults to the input cube's file stem.
    pub fn output_filename(&self) -> Result<String, TaskError> {
        if let Some(name) = self.get("output.filename").filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        let input = self.input_data()?;
        let stem = input
            .file_stem()
            .ok_or_else(|| TaskError::params(&self.path, "input.data has no file name"))?;
        Ok(stem.to_string_lossy().into_owned())
    }

    pub fn region(&self) -> Option<&str> {
        self.get("input.region").filter(|r| !r.is_empty())
    }

    /// Raw parameter blob persisted on the instance row.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            // Relative entries resolve by their final component, next to the
            // parameter file.
            match path.file_name() {
                Some(name) => self.cwd.join(name),
                None => self.cwd.clone(),
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(content: &str) -> SofiaParams {
        SofiaParams::parse(Path::new("/data/region1/sofia.par"), content).unwrap()
    }

    #[test]
    fn parses_key_value_lines_and_comments() {
        let p = params(
            "# SoFiA parameters\n\
             input.data = /cubes/survey.fits\n\
             output.directory = /out\n\
             Output.Filename = survey_a\n\
             \n\
             input.region = 0,10,0,10,0,5\n",
        );
        assert_eq!(p.get("input.data"), Some("/cubes/survey.fits"));
        assert_eq!(p.get("output.filename"), Some("survey_a"));
        assert_eq!(p.region(), Some("0,10,0,10,0,5"));
    }

    #[test]
    fn output_filename_falls_back_to_input_stem() {
        let p = params("input.data = /cubes/survey.fits\noutput.directory = /out\n");
        assert_eq!(p.output_filename().unwrap(), "survey");
    }

    #[test]
    fn relative_paths_resolve_next_to_the_parameter_file() {
        let p = params("input.data = cubes/survey.fits\noutput.directory = output\n");
        assert_eq!(
            p.input_data().unwrap(),
            PathBuf::from("/data/region1/survey.fits")
        );
        assert_eq!(
            p.output_directory().unwrap(),
            PathBuf::from("/data/region1/output")
        );
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let p = params("output.directory = /out\n");
        assert!(p.input_data().is_err());
    }

    #[tokio::test]
    async fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.par");
        tokio::fs::write(&path, "\n  \n").await.unwrap();
        assert!(matches!(
            SofiaParams::load(&path).await,
            Err(TaskError::Params { .. })
        ));
    }
}

//! Pipeline configuration document
//!
//! The YAML file fetched from the repository at the pipeline's commit. Every
//! top-level key other than the reserved ones below defines a job.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;

/// Decoded pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default image for jobs that do not set their own
    pub image: String,
    /// Declared stages
    pub stages: Vec<String>,
    /// Shell forced on every job of the pipeline
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub variables: BTreeMap<String, String>,
    /// Pipeline-level registry credentials (Docker `config.json` format)
    #[serde(default)]
    pub docker_auth_config: Option<String>,
    /// Job definitions keyed by job name
    #[serde(flatten)]
    pub jobs: HashMap<String, JobConfig>,
}

/// Settings for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub variables: BTreeMap<String, String>,
    /// Job-level registry credentials (Docker `config.json` format)
    #[serde(default)]
    pub docker_auth_config: Option<String>,
}

impl PipelineConfig {
    /// Parses a configuration document
    pub fn parse(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Returns the settings of a job, if the document defines it
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.get(name)
    }
}

/// Accepts any YAML scalar as a variable value
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    let mut out = BTreeMap::new();

    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_yaml::Value::Null => String::new(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            _ => {
                return Err(D::Error::custom(format!(
                    "variable '{key}' must be a scalar"
                )));
            }
        };
        out.insert(key, value);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
image: docker.io/library/rust:1
stages: [build, test]
variables:
  RUST_LOG: debug
  RETRIES: 3
build:
  stage: build
  commands:
    - cargo build
test:
  stage: test
  image: docker.io/library/rust:${RUST_VERSION}
  shell: bash
  commands:
    - cargo test
  variables:
    CI_FAST: true
  docker_auth_config: '{"auths":{}}'
"#;

    #[test]
    fn test_parse_jobs_and_globals() {
        let config = PipelineConfig::parse(DOCUMENT).unwrap();

        assert_eq!(config.image, "docker.io/library/rust:1");
        assert_eq!(config.stages, vec!["build", "test"]);
        assert_eq!(config.variables.get("RETRIES").map(String::as_str), Some("3"));
        assert_eq!(config.jobs.len(), 2);

        let test = config.job("test").unwrap();
        assert_eq!(test.shell.as_deref(), Some("bash"));
        assert_eq!(test.commands, vec!["cargo test"]);
        assert_eq!(test.variables.get("CI_FAST").map(String::as_str), Some("true"));
        assert!(test.docker_auth_config.is_some());

        assert!(config.job("deploy").is_none());
    }

    #[test]
    fn test_missing_required_fields() {
        assert!(PipelineConfig::parse("stages: [build]\n").is_err());
        assert!(PipelineConfig::parse("image: alpine\n").is_err());
    }

    #[test]
    fn test_nested_variable_is_rejected() {
        let doc = "image: alpine\nstages: []\nvariables:\n  A: [1, 2]\n";
        assert!(PipelineConfig::parse(doc).is_err());
    }
}

//! Registry credentials
//!
//! Credentials come from four independent sources (runner, pipeline
//! environment, pipeline configuration, job configuration). They are never
//! merged into one stored set; instead the list of sets is scanned in order
//! at pull time and later sets override earlier ones for the same registry.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Registry every unqualified image reference resolves to
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Username/password pair for one registry
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl RegistryAuth {
    /// Encodes the pair the way Docker `config.json` stores it
    pub fn encoded(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.password))
    }
}

/// One source's credentials, keyed by normalised registry host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfigs {
    entries: HashMap<String, RegistryAuth>,
}

#[derive(Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl AuthConfigs {
    /// Parses a Docker `config.json` style document
    ///
    /// An entry may carry either a base64 `auth` field (`user:password`) or
    /// explicit `username`/`password` fields.
    pub fn parse(json: &str) -> Result<Self> {
        let file: DockerConfigFile =
            serde_json::from_str(json).map_err(|e| Error::InvalidAuth(e.to_string()))?;

        let mut entries = HashMap::new();
        for (registry, entry) in file.auths {
            let auth = match (entry.username, entry.password, entry.auth) {
                (Some(username), Some(password), _) => RegistryAuth { username, password },
                (_, _, Some(encoded)) => decode_auth(&registry, &encoded)?,
                _ => {
                    return Err(Error::InvalidAuth(format!(
                        "entry for {registry} has neither auth nor username/password"
                    )));
                }
            };
            entries.insert(normalize_registry(&registry), auth);
        }

        Ok(Self { entries })
    }

    /// Parses an optional document; absent or blank means no credentials
    pub fn parse_optional(json: Option<&str>) -> Result<Self> {
        match json {
            Some(json) if !json.trim().is_empty() => Self::parse(json),
            _ => Ok(Self::default()),
        }
    }

    pub fn insert(&mut self, registry: &str, auth: RegistryAuth) {
        self.entries.insert(normalize_registry(registry), auth);
    }

    pub fn get(&self, registry: &str) -> Option<&RegistryAuth> {
        self.entries.get(&normalize_registry(registry))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decode_auth(registry: &str, encoded: &str) -> Result<RegistryAuth> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidAuth(format!("{registry}: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidAuth(format!("{registry}: auth is not valid UTF-8")))?;
    let (username, password) = text
        .split_once(':')
        .ok_or_else(|| Error::InvalidAuth(format!("{registry}: auth is not user:password")))?;

    Ok(RegistryAuth {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Reduces a registry key to its bare host
///
/// `https://index.docker.io/v1/`, `index.docker.io` and
/// `registry-1.docker.io` all become `docker.io`.
pub fn normalize_registry(key: &str) -> String {
    let key = key
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = key.split('/').next().unwrap_or(key).to_ascii_lowercase();

    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            DEFAULT_REGISTRY.to_string()
        }
        _ => host,
    }
}

/// Returns the registry an image reference pulls from
pub fn registry_of(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            normalize_registry(first)
        }
        _ => DEFAULT_REGISTRY.to_string(),
    }
}

/// Finds the credential for a registry across ordered sources
///
/// Later sources win, so callers pass `[runner, environment, pipeline, job]`.
pub fn resolve<'a>(registry: &str, sources: &'a [AuthConfigs]) -> Option<&'a RegistryAuth> {
    let key = normalize_registry(registry);
    sources
        .iter()
        .filter_map(|source| source.entries.get(&key))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(registry: &str, user: &str) -> AuthConfigs {
        let mut configs = AuthConfigs::default();
        configs.insert(
            registry,
            RegistryAuth {
                username: user.to_string(),
                password: format!("{user}-pw"),
            },
        );
        configs
    }

    #[test]
    fn test_parse_base64_and_plain_entries() {
        let json = r#"{"auths":{
            "https://index.docker.io/v1/": {"auth": "YWxpY2U6aHVudGVyMg=="},
            "ghcr.io": {"username": "bob", "password": "token"}
        }}"#;
        let configs = AuthConfigs::parse(json).unwrap();

        let hub = configs.get("docker.io").unwrap();
        assert_eq!(hub.username, "alice");
        assert_eq!(hub.password, "hunter2");
        assert_eq!(configs.get("ghcr.io").unwrap().username, "bob");
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(matches!(
            AuthConfigs::parse("{not json"),
            Err(Error::InvalidAuth(_))
        ));
        assert!(AuthConfigs::parse(r#"{"auths":{"ghcr.io":{"auth":"bm9jb2xvbg=="}}}"#).is_err());
    }

    #[test]
    fn test_optional_blank_is_empty() {
        assert!(AuthConfigs::parse_optional(None).unwrap().is_empty());
        assert!(AuthConfigs::parse_optional(Some("  ")).unwrap().is_empty());
    }

    #[test]
    fn test_registry_of_image() {
        assert_eq!(registry_of("alpine"), "docker.io");
        assert_eq!(registry_of("library/alpine:3"), "docker.io");
        assert_eq!(registry_of("ghcr.io/acme/app:1"), "ghcr.io");
        assert_eq!(registry_of("localhost:5000/app"), "localhost:5000");
        assert_eq!(registry_of("localhost/app"), "localhost");
    }

    #[test]
    fn test_precedence_runner_env_pipeline_job() {
        let runner = single("ghcr.io", "runner");
        let env = single("ghcr.io", "env");
        let pipeline = single("ghcr.io", "pipeline");
        let job = single("ghcr.io", "job");

        let all = [runner.clone(), env.clone(), pipeline.clone(), job];
        assert_eq!(resolve("ghcr.io", &all).unwrap().username, "job");

        let no_job = [runner.clone(), env.clone(), pipeline, AuthConfigs::default()];
        assert_eq!(resolve("ghcr.io", &no_job).unwrap().username, "pipeline");

        let no_pipeline = [runner.clone(), env, AuthConfigs::default(), AuthConfigs::default()];
        assert_eq!(resolve("ghcr.io", &no_pipeline).unwrap().username, "env");

        let runner_only = [runner, AuthConfigs::default()];
        assert_eq!(resolve("ghcr.io", &runner_only).unwrap().username, "runner");

        assert!(resolve("quay.io", &runner_only).is_none());
    }

    #[test]
    fn test_encoded_round_trips_through_parse() {
        let auth = RegistryAuth {
            username: "u".to_string(),
            password: "p:w".to_string(),
        };
        let json = format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, auth.encoded());
        assert_eq!(AuthConfigs::parse(&json).unwrap().get("quay.io"), Some(&auth));
    }
}

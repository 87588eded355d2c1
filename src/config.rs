//! Configuration management for feature-pilot
//!
//! Stores settings in ~/.config/feature-pilot/config.toml. Environment
//! variables take precedence over values from the file. The resolved config is
//! handed to constructors explicitly; nothing here writes to the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-exp:free";
pub const DEFAULT_MAX_TURNS: usize = 12;

/// Name of the project synthesised from `GITHUB_REPO`.
pub const ENV_PROJECT_NAME: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible endpoint; `/chat/completions` is appended.
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound on model turns in one analysis.
    pub max_turns: usize,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            max_turns: DEFAULT_MAX_TURNS,
            request_timeout_secs: 90,
        }
    }
}

impl LlmConfig {
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .context("No API key configured. Set OPENROUTER_API_KEY or add api_key under [llm].")
    }
}

/// One repository the service may analyze and patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// `owner/repo` or a github.com URL.
    pub repository: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Config {
    /// Get the config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("feature-pilot").join("config.toml"))
    }

    /// Load config from `path`, or from the default location when it exists,
    /// then apply environment overrides.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment-style overrides through `lookup`.
    ///
    /// - `OPENROUTER_API_KEY`, then `OPENAI_API_KEY`: model API key
    /// - `OPENAI_API_BASE`: model endpoint
    /// - `GITHUB_REPO`: defines (or repoints) the project named `default`
    /// - `GITHUB_TOKEN`: token for every project
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("OPENROUTER_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.llm.api_key = Some(key);
        }
        if let Some(base) = var("OPENAI_API_BASE") {
            self.llm.api_base = base;
        }

        if let Some(repository) = var("GITHUB_REPO") {
            match self
                .projects
                .iter_mut()
                .find(|p| p.name == ENV_PROJECT_NAME)
            {
                Some(project) => project.repository = repository,
                None => self.projects.push(ProjectConfig {
                    name: ENV_PROJECT_NAME.to_string(),
                    repository,
                    token: None,
                    default_branch: default_branch(),
                }),
            }
        }

        if let Some(token) = var("GITHUB_TOKEN") {
            for project in &mut self.projects {
                project.token = Some(token.clone());
            }
        }
    }

    pub fn project(&self, name: &str) -> Result<&ProjectConfig> {
        self.projects
            .iter()
            .find(|p| p.name == name)
            .with_context(|| {
                let known: Vec<&str> = self.projects.iter().map(|p| p.name.as_str()).collect();
                if known.is_empty() {
                    format!("Unknown project '{}': no projects are configured", name)
                } else {
                    format!(
                        "Unknown project '{}'. Configured projects: {}",
                        name,
                        known.join(", ")
                    )
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
[llm]
api_key = "sk-file"
model = "openai/gpt-4o-mini"
max_turns = 6

[[projects]]
name = "storefront"
repository = "acme/storefront"
token = "file-token"

[[projects]]
name = "docs"
repository = "https://github.com/acme/docs.git"
default_branch = "develop"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.llm.model, DEFAULT_MODEL);
        assert_eq!(config.llm.max_turns, 12);
        assert!((config.llm.temperature - 0.1).abs() < f32::EPSILON);
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_parse_fills_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.llm.model, "openai/gpt-4o-mini");
        assert_eq!(config.llm.max_turns, 6);
        assert_eq!(config.llm.api_base, DEFAULT_API_BASE);

        let storefront = config.project("storefront").unwrap();
        assert_eq!(storefront.default_branch, "main");
        assert_eq!(storefront.token.as_deref(), Some("file-token"));
        assert_eq!(config.project("docs").unwrap().default_branch, "develop");
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.projects.len(), 2);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("nope.toml").as_path()))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read config file"));
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[[projects]]\nname = 3\n").unwrap();
        let err = Config::from_file(file.path()).unwrap_err().to_string();
        assert!(err.contains("Invalid config file"));
    }

    #[test]
    fn test_environment_takes_precedence() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.apply_overrides(env(&[
            ("OPENAI_API_KEY", "sk-openai"),
            ("OPENROUTER_API_KEY", "sk-env"),
            ("OPENAI_API_BASE", "http://localhost:8080/v1"),
            ("GITHUB_TOKEN", "env-token"),
        ]));

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.llm.api_base, "http://localhost:8080/v1");
        assert!(config
            .projects
            .iter()
            .all(|p| p.token.as_deref() == Some("env-token")));
    }

    #[test]
    fn test_empty_environment_values_are_ignored() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.apply_overrides(env(&[("OPENROUTER_API_KEY", ""), ("GITHUB_TOKEN", "  ")]));
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-file"));
        assert_eq!(
            config.project("storefront").unwrap().token.as_deref(),
            Some("file-token")
        );
    }

    #[test]
    fn test_github_repo_defines_default_project() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("GITHUB_REPO", "acme/site"),
            ("GITHUB_TOKEN", "t"),
        ]));

        let project = config.project(ENV_PROJECT_NAME).unwrap();
        assert_eq!(project.repository, "acme/site");
        assert_eq!(project.token.as_deref(), Some("t"));
        assert_eq!(project.default_branch, "main");
    }

    #[test]
    fn test_unknown_project_lists_known_names() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let err = config.project("blog").unwrap_err().to_string();
        assert!(err.contains("storefront, docs"));

        let err = Config::default().project("blog").unwrap_err().to_string();
        assert!(err.contains("no projects are configured"));
    }

    #[test]
    fn test_require_api_key() {
        let mut llm = LlmConfig::default();
        assert!(llm.require_api_key().is_err());
        llm.api_key = Some("sk".to_string());
        assert_eq!(llm.require_api_key().unwrap(), "sk");
    }
}

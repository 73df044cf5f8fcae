// src/model/profile.rs
//! Named, reusable runner configuration

use crate::model::ids::ProfileId;
use crate::utils::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported runner kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerKind {
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "opencode")]
    OpenCode,
    #[serde(rename = "stub")]
    Stub,
}

impl RunnerKind {
    pub const ALL: [RunnerKind; 4] = [
        RunnerKind::ClaudeCode,
        RunnerKind::Codex,
        RunnerKind::OpenCode,
        RunnerKind::Stub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::ClaudeCode => "claude-code",
            RunnerKind::Codex => "codex",
            RunnerKind::OpenCode => "opencode",
            RunnerKind::Stub => "stub",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        RunnerKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| OrchestratorError::InvalidInput(format!("unknown runner kind '{}'", s)))
    }
}

/// Profile: runner kind plus limits, shared by many runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,

    /// Which adapter launches runs for this profile
    pub runner: RunnerKind,

    /// Model name passed to the runner
    #[serde(default)]
    pub model: Option<String>,

    /// Maximum agent turns
    #[serde(default)]
    pub max_turns: Option<u32>,

    /// Per-run timeout in seconds; orchestrator default when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Tools the agent may use
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Whether runs need an isolated workspace; orchestrator default when absent
    #[serde(default)]
    pub sandbox: Option<bool>,
}

impl Profile {
    pub fn new(id: impl Into<ProfileId>, runner: RunnerKind) -> Self {
        Self {
            id: id.into(),
            runner,
            model: None,
            max_turns: None,
            timeout_secs: None,
            allowed_tools: vec![],
            sandbox: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Effective timeout given the orchestrator default
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// Effective sandbox requirement given the orchestrator default
    pub fn requires_sandbox(&self, default: bool) -> bool {
        self.sandbox.unwrap_or(default)
    }

    /// Reject obviously malformed profiles
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("profile id is empty".into()));
        }
        if self.max_turns == Some(0) {
            return Err(OrchestratorError::InvalidInput(format!(
                "profile {}: max_turns must be positive",
                self.id
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(OrchestratorError::InvalidInput(format!(
                "profile {}: timeout must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Profiles seeded from YAML at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSet {
    pub profiles: Vec<Profile>,
}

impl ProfileSet {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let set: ProfileSet = serde_yaml::from_str(text)
            .map_err(|e| OrchestratorError::SerializationFailed(format!("profiles yaml: {}", e)))?;
        for profile in &set.profiles {
            profile.validate()?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_kind_parse() {
        assert_eq!("claude-code".parse::<RunnerKind>().unwrap(), RunnerKind::ClaudeCode);
        assert_eq!("stub".parse::<RunnerKind>().unwrap(), RunnerKind::Stub);
        assert!("gpt-engineer".parse::<RunnerKind>().is_err());
    }

    #[test]
    fn test_effective_settings() {
        let profile = Profile::new("P1", RunnerKind::Stub);
        assert_eq!(
            profile.effective_timeout(Duration::from_secs(1800)),
            Duration::from_secs(1800)
        );
        assert!(profile.requires_sandbox(true));

        let profile = profile.with_timeout(Duration::from_secs(60)).with_sandbox(false);
        assert_eq!(
            profile.effective_timeout(Duration::from_secs(1800)),
            Duration::from_secs(60)
        );
        assert!(!profile.requires_sandbox(true));
    }

    #[test]
    fn test_profiles_from_yaml() {
        let yaml = r#"
profiles:
  - id: default-claude
    runner: claude-code
    model: sonnet
    max_turns: 40
    timeout_secs: 3600
    allowed_tools: [Read, Edit, Bash]
  - id: quick-codex
    runner: codex
    sandbox: false
"#;
        let set = ProfileSet::from_yaml(yaml).unwrap();
        assert_eq!(set.profiles.len(), 2);
        assert_eq!(set.profiles[0].runner, RunnerKind::ClaudeCode);
        assert_eq!(set.profiles[0].allowed_tools, vec!["Read", "Edit", "Bash"]);
        assert_eq!(set.profiles[1].sandbox, Some(false));
    }

    #[test]
    fn test_validation_rejects_zero_turns() {
        let mut profile = Profile::new("P1", RunnerKind::Codex);
        profile.max_turns = Some(0);
        assert!(profile.validate().is_err());
    }
}

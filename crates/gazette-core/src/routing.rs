//! Routing resolution: (agent, profile) to a concrete model identifier.
//!
//! Resolution happens once per task, at first claim, and the result is
//! frozen into the task row. Later edits to the routing configuration can
//! never change which model a retried task runs against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Quality profile requested for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Fast,
    Quality,
}

impl Profile {
    pub fn label(&self) -> &'static str {
        match self {
            Profile::Fast => "fast",
            Profile::Quality => "quality",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Profile::Fast),
            "quality" => Ok(Profile::Quality),
            other => Err(format!("unknown profile: {other:?} (use fast or quality)")),
        }
    }
}

/// Profile-to-model table for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileModels {
    pub fast: Option<String>,
    pub quality: Option<String>,
}

impl ProfileModels {
    fn get(&self, profile: Profile) -> Option<&str> {
        match profile {
            Profile::Fast => self.fast.as_deref(),
            Profile::Quality => self.quality.as_deref(),
        }
    }
}

fn default_profile() -> Profile {
    Profile::Fast
}

/// Routing entry for one named agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRoutes {
    /// Shell-free command template with `{model}`, `{prompt}`,
    /// `{prompt_file}` and `{manifest}` placeholders.
    pub command_template: String,
    #[serde(default = "default_profile")]
    pub default_profile: Profile,
    #[serde(default)]
    pub models: ProfileModels,
}

/// Routing tables, loaded from configuration and passed explicitly to the
/// worker (never read from global state once a task is claimed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub default_agent: String,
    pub agents: HashMap<String, AgentRoutes>,
}

impl RoutingConfig {
    pub fn agent(&self, name: &str) -> Option<&AgentRoutes> {
        self.agents.get(name)
    }
}

/// Resolved immutable routing stored with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenRouting {
    pub agent: String,
    pub profile: Profile,
    pub model: String,
    pub command_template: String,
    pub resolved_at: DateTime<Utc>,
}

/// Routing could not be resolved; maps to `configuration_error`, which
/// bypasses the failure classifier and fails the task immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    UnknownAgent(String),
    NoModelMapping { agent: String, profile: Profile },
    EmptyCommandTemplate(String),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::UnknownAgent(agent) => {
                write!(f, "no routing configured for agent {agent:?}")
            }
            RoutingError::NoModelMapping { agent, profile } => write!(
                f,
                "agent {agent:?} has no model mapping for profile {profile} or its default profile"
            ),
            RoutingError::EmptyCommandTemplate(agent) => {
                write!(f, "agent {agent:?} has an empty command template")
            }
        }
    }
}

impl std::error::Error for RoutingError {}

/// Resolve a routing request against the current configuration.
///
/// Order: explicit model override wins; otherwise the requested profile's
/// mapping for the named agent; otherwise the agent's default-profile
/// mapping. An unknown agent is a configuration error.
pub fn resolve(
    config: &RoutingConfig,
    request: &crate::task::RoutingRequest,
) -> Result<FrozenRouting, RoutingError> {
    let agent_name = request
        .agent
        .as_deref()
        .unwrap_or(&config.default_agent)
        .trim()
        .to_lowercase();
    let routes = config
        .agent(&agent_name)
        .ok_or_else(|| RoutingError::UnknownAgent(agent_name.clone()))?;

    let command_template = routes.command_template.trim().to_string();
    if command_template.is_empty() {
        return Err(RoutingError::EmptyCommandTemplate(agent_name));
    }

    let profile = request.profile.unwrap_or(routes.default_profile);
    let model = match request.model.as_deref().map(str::trim) {
        Some(model) if !model.is_empty() => model.to_string(),
        _ => routes
            .models
            .get(profile)
            .or_else(|| routes.models.get(routes.default_profile))
            .map(str::to_string)
            .ok_or(RoutingError::NoModelMapping {
                agent: agent_name.clone(),
                profile,
            })?,
    };

    Ok(FrozenRouting {
        agent: agent_name,
        profile,
        model,
        command_template,
        resolved_at: Utc::now(),
    })
}

//! Deployment parameters and the capability set resolved at deploy time.
//!
//! A bot either runs a standalone script or hosts a set of controllers. The
//! two variants differ in what the bot reports and how it is started; that
//! difference is captured once in [`Capabilities`] so the orchestrator never
//! branches on the variant afterwards.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ControlError;

/// Script used to host controller-based bots.
pub const CONTROLLER_HOST_SCRIPT: &str = "v2_with_controllers.py";

fn default_image() -> String {
    "hummingbot/hummingbot:latest".to_string()
}

/// Resource limits applied to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU budget in millicores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u32>,
    /// Memory budget in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

/// What the bot process runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotProgram {
    /// A single strategy script with an optional configuration document.
    Script {
        #[serde(default)]
        script: Option<String>,
        #[serde(default)]
        script_config: Option<String>,
    },
    /// A controller host running one or more controller configurations.
    Controllers {
        controllers: Vec<String>,
        #[serde(default)]
        max_global_drawdown: Option<Decimal>,
        #[serde(default)]
        max_controller_drawdown: Option<Decimal>,
    },
}

/// Behaviour of a deployed bot, resolved once from its [`BotProgram`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The bot publishes per-controller performance in its status detail.
    pub reports_performance: bool,
    /// Status detail carries a per-controller status map.
    pub controller_status: bool,
    /// Parameters sent with the start command.
    pub start_params: serde_json::Value,
}

impl BotProgram {
    /// Resolve the capability set for this program.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Script {
                script,
                script_config,
            } => Capabilities {
                reports_performance: false,
                controller_status: false,
                start_params: json!({
                    "script": script,
                    "conf": script_config,
                }),
            },
            Self::Controllers {
                controllers,
                max_global_drawdown,
                max_controller_drawdown,
            } => Capabilities {
                reports_performance: true,
                controller_status: true,
                start_params: json!({
                    "script": CONTROLLER_HOST_SCRIPT,
                    "controllers_config": controllers,
                    "max_global_drawdown": max_global_drawdown,
                    "max_controller_drawdown": max_controller_drawdown,
                }),
            },
        }
    }
}

/// Deployment parameters for one bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotDeployment {
    /// Image or version identifier of the bot runtime.
    #[serde(default = "default_image")]
    pub image: String,
    /// Credentials profile provisioned into the sandbox.
    pub credentials_profile: String,
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Extra environment passed to the bot process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub program: BotProgram,
}

impl BotDeployment {
    /// A script deployment with default image and limits.
    pub fn script(credentials_profile: impl Into<String>, script: Option<String>) -> Self {
        Self {
            image: default_image(),
            credentials_profile: credentials_profile.into(),
            resources: ResourceLimits::default(),
            env: BTreeMap::new(),
            program: BotProgram::Script {
                script,
                script_config: None,
            },
        }
    }

    /// A controller deployment with default image and limits.
    pub fn controllers(credentials_profile: impl Into<String>, controllers: Vec<String>) -> Self {
        Self {
            image: default_image(),
            credentials_profile: credentials_profile.into(),
            resources: ResourceLimits::default(),
            env: BTreeMap::new(),
            program: BotProgram::Controllers {
                controllers,
                max_global_drawdown: None,
                max_controller_drawdown: None,
            },
        }
    }

    /// Check the deployment is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidRequest`] describing the first problem.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.image.trim().is_empty() {
            return Err(ControlError::InvalidRequest("image must not be empty".into()));
        }
        if self.credentials_profile.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "credentials_profile must not be empty".into(),
            ));
        }
        if self.credentials_profile.contains(['/', '\\']) || self.credentials_profile == ".." {
            return Err(ControlError::InvalidRequest(
                "credentials_profile must be a plain directory name".into(),
            ));
        }
        if let BotProgram::Controllers {
            controllers,
            max_global_drawdown,
            max_controller_drawdown,
        } = &self.program
        {
            if controllers.is_empty() {
                return Err(ControlError::InvalidRequest(
                    "controller deployment needs at least one controller".into(),
                ));
            }
            for (field, value) in [
                ("max_global_drawdown", max_global_drawdown),
                ("max_controller_drawdown", max_controller_drawdown),
            ] {
                if let Some(v) = value {
                    if *v < Decimal::ZERO || *v > Decimal::ONE {
                        return Err(ControlError::InvalidRequest(format!(
                            "{field} must be between 0 and 1"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn script_capabilities() {
        let deployment = BotDeployment::script("master", Some("pmm.py".into()));
        let caps = deployment.program.capabilities();
        assert!(!caps.reports_performance);
        assert!(!caps.controller_status);
        assert_eq!(caps.start_params["script"], "pmm.py");
    }

    #[test]
    fn controller_capabilities() {
        let deployment = BotDeployment::controllers("master", vec!["grid.yml".into()]);
        let caps = deployment.program.capabilities();
        assert!(caps.reports_performance);
        assert!(caps.controller_status);
        assert_eq!(caps.start_params["script"], CONTROLLER_HOST_SCRIPT);
        assert_eq!(caps.start_params["controllers_config"][0], "grid.yml");
    }

    #[test]
    fn validate_rejects_empty_controllers() {
        let deployment = BotDeployment::controllers("master", vec![]);
        assert!(matches!(
            deployment.validate(),
            Err(ControlError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validate_rejects_drawdown_out_of_range() {
        let mut deployment = BotDeployment::controllers("master", vec!["a.yml".into()]);
        deployment.program = BotProgram::Controllers {
            controllers: vec!["a.yml".into()],
            max_global_drawdown: Some(dec!(1.5)),
            max_controller_drawdown: None,
        };
        assert!(deployment.validate().is_err());
    }

    #[test]
    fn validate_rejects_path_like_profile() {
        let deployment = BotDeployment::script("../etc", None);
        assert!(deployment.validate().is_err());
    }

    #[test]
    fn deserializes_tagged_program() {
        let toml_src = r#"
            credentials_profile = "master"
            [program]
            type = "controllers"
            controllers = ["grid.yml", "dman.yml"]
            max_global_drawdown = "0.2"
        "#;
        let deployment: BotDeployment = toml::from_str(toml_src).unwrap();
        assert_eq!(deployment.image, "hummingbot/hummingbot:latest");
        match deployment.program {
            BotProgram::Controllers {
                controllers,
                max_global_drawdown,
                ..
            } => {
                assert_eq!(controllers.len(), 2);
                assert_eq!(max_global_drawdown, Some(dec!(0.2)));
            }
            other => panic!("unexpected program {other:?}"),
        }
    }
}

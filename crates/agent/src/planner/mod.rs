//! Planner implementations.
//!
//! - [`CommandPlanner`]: deterministic slash commands, no model involved
//! - [`LlmPlanner`]: JSON plans from an OpenAI-compatible chat endpoint

pub mod command;
pub mod llm;

pub use command::CommandPlanner;
pub use llm::LlmPlanner;

use cortex_config::{AppConfig, PlannerKind};
use cortex_core::Planner;
use cortex_core::error::PlannerError;
use std::sync::Arc;
use tracing::info;

/// Build the planner selected in config.
///
/// `Llm` without an API key is a configuration error rather than a silent
/// fallback to commands.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Planner>, PlannerError> {
    let history = config.agent.history_turns;
    match config.planner.kind {
        PlannerKind::Command => {
            info!("Using command planner");
            Ok(Arc::new(CommandPlanner::new().with_history(history)))
        }
        PlannerKind::Llm => {
            if !config.has_api_key() {
                return Err(PlannerError::NotConfigured(
                    "planner.kind = \"llm\" needs an API key (set CORTEX_API_KEY or planner.api_key)".into(),
                ));
            }
            info!(model = %config.planner.model, "Using LLM planner");
            Ok(Arc::new(LlmPlanner::from_config(&config.planner).with_history(history)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_builds_without_credentials() {
        let mut config = AppConfig::default();
        config.planner.kind = PlannerKind::Command;
        assert_eq!(from_config(&config).unwrap().name(), "command");
    }

    #[test]
    fn llm_kind_requires_api_key() {
        let mut config = AppConfig::default();
        config.planner.kind = PlannerKind::Llm;
        config.planner.api_key = None;
        assert!(matches!(from_config(&config), Err(PlannerError::NotConfigured(_))));

        config.planner.api_key = Some("sk-test".into());
        assert_eq!(from_config(&config).unwrap().name(), "llm");
    }
}

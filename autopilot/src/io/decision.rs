//! Decision engine seam: proposes the next action from an observation.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::classifier::{ActionDescription, ActionPlan};
use crate::core::command::Command;
use crate::core::types::Observation;

/// Free-form notes returned alongside an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub plan: Option<String>,
    pub reflection: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub info: DecisionInfo,
    pub action: ActionDescription,
}

impl Decision {
    pub fn new(action: ActionDescription) -> Self {
        Self {
            info: DecisionInfo::default(),
            action,
        }
    }

    pub fn plan(plan: ActionPlan) -> Self {
        Self::new(ActionDescription::Structured(plan))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(ActionDescription::text(text))
    }

    pub fn execute(commands: Vec<Command>) -> Self {
        Self::plan(ActionPlan::Execute(commands))
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.info.plan = Some(plan.into());
        self
    }

    pub fn with_reflection(mut self, reflection: impl Into<String>) -> Self {
        self.info.reflection = Some(reflection.into());
        self
    }
}

/// External model that decides what to do next.
pub trait DecisionEngine: Send + Sync {
    fn predict(&self, instruction: &str, observation: &Observation) -> Result<Decision>;

    /// Check the engine is reachable and usable before a task starts.
    fn validate(&self, _observation: &Observation) -> Result<()> {
        Ok(())
    }
}

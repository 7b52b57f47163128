//! Typed execution plans for delegated background work.
//!
//! The delegation planner makes two orthogonal decisions: **when** a task
//! runs (`Execution`) and **how** it runs (`ProcessorSpec`). The processor
//! is an internally-tagged enum so a plan can only carry the fields its
//! processor actually uses — there is no "agent plan with a tool_name".

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// When a background task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Run now, in the background
    Immediate,
    /// Run once after `delay_seconds`
    Delayed,
    /// Run on a cron schedule
    Recurring,
    /// Run on a cron schedule, deliver only when there is something to report
    Monitor,
}

/// Whether a scheduled run always notifies or may skip silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyCondition {
    #[default]
    Always,
    NotifySkip,
}

impl NotifyCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyCondition::Always => "always",
            NotifyCondition::NotifySkip => "notify_skip",
        }
    }
}

/// How a background task executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "processor", rename_all = "lowercase")]
pub enum ProcessorSpec {
    /// Deliver a literal text message. No LLM.
    Static { message: String },

    /// Invoke one tool with known arguments. The tool call is the entire
    /// side effect; nothing else is delivered.
    Function {
        tool_name: String,
        #[serde(default)]
        tool_args: serde_json::Value,
    },

    /// Run an isolated LightAgent with its own prompt, tool subset, and
    /// model. The agent owns delivery of its own result.
    Agent {
        prompt: String,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        model: Option<String>,
    },
}

impl ProcessorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorSpec::Static { .. } => "static",
            ProcessorSpec::Function { .. } => "function",
            ProcessorSpec::Agent { .. } => "agent",
        }
    }
}

/// A validated delegation plan: when to run, how to run, where to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub execution: Execution,

    /// Required iff `execution == Delayed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,

    /// Required iff `execution ∈ {Recurring, Monitor}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,

    #[serde(default)]
    pub notify_condition: NotifyCondition,

    /// Delivery channel; None means the originating channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(flatten)]
    pub processor: ProcessorSpec,
}

impl ExecutionPlan {
    /// Monitor plans always imply notify_skip, whatever the planner said.
    pub fn normalize(mut self) -> Self {
        if self.execution == Execution::Monitor {
            self.notify_condition = NotifyCondition::NotifySkip;
        }
        self
    }

    /// Enforce the iff-rules between execution type and timing fields.
    pub fn validate(&self) -> std::result::Result<(), PlanError> {
        match self.execution {
            Execution::Delayed if self.delay_seconds.is_none() => {
                return Err(PlanError::Invalid(
                    "delayed execution requires delay_seconds".into(),
                ));
            }
            Execution::Recurring | Execution::Monitor if self.cron_expr.is_none() => {
                return Err(PlanError::Invalid(format!(
                    "{:?} execution requires cron_expr",
                    self.execution
                )));
            }
            _ => {}
        }
        if self.execution == Execution::Monitor
            && self.notify_condition != NotifyCondition::NotifySkip
        {
            return Err(PlanError::Invalid(
                "monitor execution requires notify_condition = notify_skip".into(),
            ));
        }
        match &self.processor {
            ProcessorSpec::Static { message } if message.trim().is_empty() => {
                Err(PlanError::Invalid("static plan has an empty message".into()))
            }
            ProcessorSpec::Function { tool_name, .. } if tool_name.trim().is_empty() => {
                Err(PlanError::Invalid("function plan has no tool_name".into()))
            }
            ProcessorSpec::Agent { prompt, .. } if prompt.trim().is_empty() => {
                Err(PlanError::Invalid("agent plan has an empty prompt".into()))
            }
            _ => Ok(()),
        }
    }

    /// Whether this plan is handled by the scheduler (vs. the immediate
    /// subagent worker).
    pub fn is_scheduled(&self) -> bool {
        self.execution != Execution::Immediate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_plan() -> ExecutionPlan {
        ExecutionPlan {
            execution: Execution::Delayed,
            delay_seconds: Some(7200),
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor: ProcessorSpec::Static {
                message: "Toplantı hatırlatma!".into(),
            },
        }
    }

    #[test]
    fn serialized_plan_reparses_identically() {
        let plan = static_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn processor_tag_is_flattened() {
        let plan = static_plan();
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["processor"], "static");
        assert_eq!(value["execution"], "delayed");
        assert_eq!(value["message"], "Toplantı hatırlatma!");
    }

    #[test]
    fn agent_plan_roundtrip() {
        let plan = ExecutionPlan {
            execution: Execution::Monitor,
            delay_seconds: None,
            cron_expr: Some("*/30 * * * *".into()),
            notify_condition: NotifyCondition::NotifySkip,
            channel: Some("whatsapp".into()),
            processor: ProcessorSpec::Agent {
                prompt: "Check gold price. If above 3000 TL report it. Otherwise [SKIP].".into(),
                tools: vec!["web_fetch".into(), "send_message_to_user".into()],
                model: None,
            },
        };
        let json = serde_json::to_string(&plan).unwrap();
        let back: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.processor.kind(), "agent");
    }

    #[test]
    fn delayed_without_delay_is_invalid() {
        let mut plan = static_plan();
        plan.delay_seconds = None;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn recurring_without_cron_is_invalid() {
        let mut plan = static_plan();
        plan.execution = Execution::Recurring;
        plan.delay_seconds = None;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn monitor_normalizes_to_notify_skip() {
        let plan = ExecutionPlan {
            execution: Execution::Monitor,
            delay_seconds: None,
            cron_expr: Some("0 * * * *".into()),
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor: ProcessorSpec::Agent {
                prompt: "watch".into(),
                tools: vec![],
                model: None,
            },
        }
        .normalize();
        assert_eq!(plan.notify_condition, NotifyCondition::NotifySkip);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn empty_static_message_is_invalid() {
        let plan = ExecutionPlan {
            execution: Execution::Immediate,
            delay_seconds: None,
            cron_expr: None,
            notify_condition: NotifyCondition::Always,
            channel: None,
            processor: ProcessorSpec::Static { message: "  ".into() },
        };
        assert!(plan.validate().is_err());
    }
}

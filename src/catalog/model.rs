//! Catalog types: flows, steps, retry messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The conversation flows the engine supports.
///
/// `Root` is the shared level-0 flow-selection state; every other flow starts
/// at level 1 and progresses linearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowId {
    Root,
    Registration,
    VehicleChange,
    PhoneChange,
}

impl FlowId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Registration => "registration",
            Self::VehicleChange => "vehicle_change",
            Self::PhoneChange => "phone_change",
        }
    }

    pub fn parse(s: &str) -> Option<FlowId> {
        match s {
            "root" => Some(Self::Root),
            "registration" => Some(Self::Registration),
            "vehicle_change" => Some(Self::VehicleChange),
            "phone_change" => Some(Self::PhoneChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation error categories, each mapping to a configured retry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IncorrectChoice,
    EqualLength,
    IsExist,
    IsNotExist,
    IncorrectCode,
    IsExpired,
    MaxSize,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncorrectChoice => "incorrect_choice",
            Self::EqualLength => "equal_length",
            Self::IsExist => "is_exist",
            Self::IsNotExist => "is_not_exist",
            Self::IncorrectCode => "incorrect_code",
            Self::IsExpired => "is_expired",
            Self::MaxSize => "max_size",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one step: `(flow, level)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub flow: FlowId,
    pub level: u8,
}

impl StepKey {
    pub fn new(flow: FlowId, level: u8) -> Self {
        Self { flow, level }
    }
}

/// One state in a flow: prompt plus its configured retry messages.
#[derive(Debug, Clone)]
pub struct Step {
    pub key: StepKey,
    /// Prompt text. May contain `{placeholder}` tokens.
    pub prompt: String,
    /// Optional media attached to the prompt (sample document photo, etc.).
    pub media_url: Option<String>,
    /// Per-error-type retry messages. Absence of an entry the engine needs is
    /// a configuration defect, not a user error.
    pub bad_responses: HashMap<ErrorKind, String>,
    /// Message sent when an OCR validity gate rejects a submitted document.
    pub resubmit_message: Option<String>,
}

impl Step {
    /// Render the prompt, substituting `{name}` tokens from `vars`.
    /// Unknown tokens are left in place.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut out = self.prompt.clone();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }

    pub fn bad_response(&self, error: ErrorKind) -> Option<&str> {
        self.bad_responses.get(&error).map(String::as_str)
    }
}

/// Level of the shared agent-handoff step sent on escalation abort.
pub const AGENT_HANDOFF_LEVEL: u8 = 15;

/// Immutable step directory, keyed by `(flow, level)`.
#[derive(Debug)]
pub struct Catalog {
    steps: HashMap<StepKey, Step>,
}

impl Catalog {
    pub fn new(steps: Vec<Step>) -> Self {
        let steps = steps.into_iter().map(|s| (s.key, s)).collect();
        Self { steps }
    }

    pub fn get(&self, flow: FlowId, level: u8) -> Option<&Step> {
        self.steps.get(&StepKey::new(flow, level))
    }

    /// The shared level-0 flow-selection step.
    pub fn root(&self) -> &Step {
        self.steps
            .get(&StepKey::new(FlowId::Root, 0))
            .expect("catalog is seeded with a root step")
    }

    /// The shared "contact an agent" step sent on escalation abort.
    pub fn agent_handoff(&self) -> &Step {
        self.steps
            .get(&StepKey::new(FlowId::Root, AGENT_HANDOFF_LEVEL))
            .expect("catalog is seeded with the agent-handoff step")
    }

    /// Highest level present for a flow (the confirmation step).
    pub fn last_level(&self, flow: FlowId) -> u8 {
        self.steps
            .keys()
            .filter(|k| k.flow == flow)
            .map(|k| k.level)
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

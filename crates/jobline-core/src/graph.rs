use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, Result};

/// A parsed job definition: the immutable graph a job execution walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Job name; instances and executions are grouped by it.
    pub id: String,
    /// Whether a STOPPED/FAILED execution may be restarted.
    #[serde(default = "default_true")]
    pub restartable: bool,
    /// Job-level properties, copied into the job context.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Job listener references, invoked in declaration order.
    #[serde(default)]
    pub listeners: Vec<String>,
    /// Top-level elements; the first one is the entry point.
    #[serde(default)]
    pub elements: Vec<ExecutionElement>,
}

fn default_true() -> bool {
    true
}

fn default_item_count() -> u32 {
    10
}

impl JobDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            restartable: true,
            properties: HashMap::new(),
            listeners: vec![],
            elements: vec![],
        }
    }

    pub fn with_element(mut self, element: impl Into<ExecutionElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_listener(mut self, reference: impl Into<String>) -> Self {
        self.listeners.push(reference.into());
        self
    }

    pub fn with_restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BatchError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Find a top-level element by id.
    pub fn element(&self, id: &str) -> Option<&ExecutionElement> {
        self.elements.iter().find(|e| e.id() == id)
    }
}

/// A node of the job graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionElement {
    Step(Step),
    Flow(Flow),
    Split(Split),
    Decision(Decision),
}

impl ExecutionElement {
    pub fn id(&self) -> &str {
        match self {
            ExecutionElement::Step(s) => &s.id,
            ExecutionElement::Flow(f) => &f.id,
            ExecutionElement::Split(s) => &s.id,
            ExecutionElement::Decision(d) => &d.id,
        }
    }

    /// Unconditional successor, evaluated after the explicit rules.
    pub fn next(&self) -> Option<&str> {
        match self {
            ExecutionElement::Step(s) => s.next.as_deref(),
            ExecutionElement::Flow(f) => f.next.as_deref(),
            ExecutionElement::Split(s) => s.next.as_deref(),
            ExecutionElement::Decision(_) => None,
        }
    }

    pub fn transitions(&self) -> &[TransitionRule] {
        match self {
            ExecutionElement::Step(s) => &s.transitions,
            ExecutionElement::Flow(f) => &f.transitions,
            ExecutionElement::Split(s) => &s.transitions,
            ExecutionElement::Decision(d) => &d.transitions,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionElement::Step(_) => "step",
            ExecutionElement::Flow(_) => "flow",
            ExecutionElement::Split(_) => "split",
            ExecutionElement::Decision(_) => "decision",
        }
    }

    pub fn is_decision(&self) -> bool {
        matches!(self, ExecutionElement::Decision(_))
    }

    /// Whether `id` names this element or anything nested inside it.
    pub fn contains(&self, id: &str) -> bool {
        if self.id() == id {
            return true;
        }
        match self {
            ExecutionElement::Flow(f) => f.elements.iter().any(|e| e.contains(id)),
            ExecutionElement::Split(s) => s
                .flows
                .iter()
                .any(|f| f.id == id || f.elements.iter().any(|e| e.contains(id))),
            _ => false,
        }
    }
}

impl From<Step> for ExecutionElement {
    fn from(step: Step) -> Self {
        ExecutionElement::Step(step)
    }
}

impl From<Flow> for ExecutionElement {
    fn from(flow: Flow) -> Self {
        ExecutionElement::Flow(flow)
    }
}

impl From<Split> for ExecutionElement {
    fn from(split: Split) -> Self {
        ExecutionElement::Split(split)
    }
}

impl From<Decision> for ExecutionElement {
    fn from(decision: Decision) -> Self {
        ExecutionElement::Decision(decision)
    }
}

/// Ordered rule: exit-status glob pattern to a control action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Glob pattern (`*` and `?` wildcards) matched against the exit status.
    pub on: String,
    pub action: TransitionAction,
}

impl TransitionRule {
    pub fn next(on: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Next { to: to.into() },
        }
    }

    pub fn end(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::End {
                exit_status: exit_status.map(String::from),
            },
        }
    }

    pub fn fail(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Fail {
                exit_status: exit_status.map(String::from),
            },
        }
    }

    pub fn stop(on: impl Into<String>, exit_status: Option<&str>, restart: Option<&str>) -> Self {
        Self {
            on: on.into(),
            action: TransitionAction::Stop {
                exit_status: exit_status.map(String::from),
                restart: restart.map(String::from),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionAction {
    /// Continue with another element in the same scope.
    Next { to: String },
    /// Finish COMPLETED.
    End {
        #[serde(default)]
        exit_status: Option<String>,
    },
    /// Finish FAILED.
    Fail {
        #[serde(default)]
        exit_status: Option<String>,
    },
    /// Finish STOPPED; a restart resumes at `restart`.
    Stop {
        #[serde(default)]
        exit_status: Option<String>,
        #[serde(default)]
        restart: Option<String>,
    },
}

/// A leaf element doing the actual work, through a batchlet or a chunk handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    #[serde(default)]
    pub batchlet: Option<String>,
    #[serde(default)]
    pub chunk: Option<ChunkConfig>,
    #[serde(default)]
    pub listeners: Vec<String>,
    /// Maximum number of starts across restarts; 0 means unlimited.
    #[serde(default)]
    pub start_limit: u32,
    #[serde(default)]
    pub allow_start_if_complete: bool,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: vec![],
            batchlet: None,
            chunk: None,
            listeners: vec![],
            start_limit: 0,
            allow_start_if_complete: false,
            properties: HashMap::new(),
        }
    }

    pub fn with_batchlet(mut self, reference: impl Into<String>) -> Self {
        self.batchlet = Some(reference.into());
        self
    }

    pub fn with_chunk(mut self, chunk: ChunkConfig) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, rule: TransitionRule) -> Self {
        self.transitions.push(rule);
        self
    }

    pub fn with_listener(mut self, reference: impl Into<String>) -> Self {
        self.listeners.push(reference.into());
        self
    }

    pub fn with_start_limit(mut self, limit: u32) -> Self {
        self.start_limit = limit;
        self
    }

    pub fn with_allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An ordered sub-sequence with its own transition scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    #[serde(default)]
    pub elements: Vec<ExecutionElement>,
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: vec![],
            elements: vec![],
        }
    }

    pub fn with_element(mut self, element: impl Into<ExecutionElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, rule: TransitionRule) -> Self {
        self.transitions.push(rule);
        self
    }

    /// The last Step found scanning the flow's own elements in order.
    pub fn last_step(&self) -> Option<&Step> {
        self.elements.iter().rev().find_map(|e| match e {
            ExecutionElement::Step(s) => Some(s),
            _ => None,
        })
    }
}

/// A set of flows run concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub id: String,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl Split {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: vec![],
            flows: vec![],
        }
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, rule: TransitionRule) -> Self {
        self.transitions.push(rule);
        self
    }
}

/// Computes a routing exit status from the preceding element's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    /// Decider reference resolved through the artifact factory.
    pub decider: String,
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
}

impl Decision {
    pub fn new(id: impl Into<String>, decider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            decider: decider.into(),
            transitions: vec![],
        }
    }

    pub fn with_transition(mut self, rule: TransitionRule) -> Self {
        self.transitions.push(rule);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    Item,
    Time,
    Custom,
}

/// Chunk step settings. The read/process/write loop lives in the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Chunk handler reference.
    pub handler: String,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    #[serde(default = "default_item_count")]
    pub item_count: u32,
    /// Seconds per checkpoint for the time policy; 0 disables the time limit.
    #[serde(default)]
    pub time_limit_secs: u64,
    /// Algorithm reference for the custom policy.
    #[serde(default)]
    pub checkpoint_algorithm: Option<String>,
}

impl ChunkConfig {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            checkpoint_policy: CheckpointPolicy::Item,
            item_count: default_item_count(),
            time_limit_secs: 0,
            checkpoint_algorithm: None,
        }
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    pub fn with_item_count(mut self, count: u32) -> Self {
        self.item_count = count;
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = secs;
        self
    }

    pub fn with_algorithm(mut self, reference: impl Into<String>) -> Self {
        self.checkpoint_algorithm = Some(reference.into());
        self
    }
}

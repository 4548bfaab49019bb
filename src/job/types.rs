/// Job definition types
///
/// A job is a control-flow graph of entries connected by hops. Unlike pipelines,
/// jobs may loop back on themselves; only hop references are validated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Type id of the special start entry
pub const START_ENTRY_TYPE: &str = "START";

/// A complete job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<JobEntryMeta>,
    #[serde(default)]
    pub hops: Vec<JobHop>,
    /// Name of the entry to start from. Defaults to the first `START` entry.
    #[serde(default)]
    pub start: Option<String>,
    /// Declared parameters and their default values
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Configuration of a single job entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntryMeta {
    /// Unique entry name within the job
    pub name: String,
    /// Plugin type id (e.g., "START", "PIPELINE", "JOB", "ABORT")
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Entry specific configuration
    #[serde(default)]
    pub config: Value,
    /// Launch the entries following this one concurrently
    #[serde(default)]
    pub parallel: bool,
    /// Override whether conditional hops may fire from this entry.
    /// `None` keeps the entry's own answer.
    #[serde(default)]
    pub evaluates: Option<bool>,
    /// Hand the entry the incoming result with its error count reset to zero
    #[serde(default = "default_true")]
    pub reset_errors: bool,
}

/// When a hop is followed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HopCondition {
    /// Always followed
    #[default]
    Unconditional,
    /// Followed when the source evaluates and succeeded
    OnSuccess,
    /// Followed when the source evaluates and failed
    OnFailure,
}

impl HopCondition {
    /// Whether a hop with this condition fires after an entry with the given
    /// evaluation flag and outcome
    pub fn fires(self, evaluates: bool, success: bool) -> bool {
        match self {
            HopCondition::Unconditional => true,
            HopCondition::OnSuccess => evaluates && success,
            HopCondition::OnFailure => evaluates && !success,
        }
    }

    /// Reason recorded in the tracker for a followed hop
    pub fn reason(self) -> &'static str {
        match self {
            HopCondition::Unconditional => "followed unconditional link",
            HopCondition::OnSuccess => "followed link after success",
            HopCondition::OnFailure => "followed link after failure",
        }
    }
}

/// Directed hop between two entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHop {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: HopCondition,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            hops: Vec::new(),
            start: None,
            parameters: HashMap::new(),
        }
    }

    /// Declare a parameter with its default value
    pub fn parameter(mut self, name: &str, default: &str) -> Self {
        self.parameters.insert(name.to_string(), default.to_string());
        self
    }

    /// Add an entry with the given configuration
    pub fn entry(mut self, name: &str, entry_type: &str, config: Value) -> Self {
        self.entries.push(JobEntryMeta {
            name: name.to_string(),
            entry_type: entry_type.to_string(),
            config,
            parallel: false,
            evaluates: None,
            reset_errors: true,
        });
        self
    }

    /// Add an entry whose successors run in parallel
    pub fn parallel_entry(mut self, name: &str, entry_type: &str, config: Value) -> Self {
        self = self.entry(name, entry_type, config);
        if let Some(meta) = self.entries.last_mut() {
            meta.parallel = true;
        }
        self
    }

    pub fn hop(self, from: &str, to: &str) -> Self {
        self.conditional_hop(from, to, HopCondition::Unconditional)
    }

    pub fn on_success(self, from: &str, to: &str) -> Self {
        self.conditional_hop(from, to, HopCondition::OnSuccess)
    }

    pub fn on_failure(self, from: &str, to: &str) -> Self {
        self.conditional_hop(from, to, HopCondition::OnFailure)
    }

    pub fn conditional_hop(mut self, from: &str, to: &str, condition: HopCondition) -> Self {
        self.hops.push(JobHop {
            from: from.to_string(),
            to: to.to_string(),
            condition,
            enabled: true,
        });
        self
    }

    pub fn find_entry(&self, name: &str) -> Option<&JobEntryMeta> {
        self.entries.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hop_evaluation_rules() {
        assert!(HopCondition::Unconditional.fires(false, false));
        assert!(HopCondition::Unconditional.fires(true, false));
        assert!(HopCondition::OnSuccess.fires(true, true));
        assert!(!HopCondition::OnSuccess.fires(true, false));
        assert!(HopCondition::OnFailure.fires(true, false));
        assert!(!HopCondition::OnFailure.fires(true, true));
        // A non-evaluating entry never fires conditional hops
        assert!(!HopCondition::OnSuccess.fires(false, true));
        assert!(!HopCondition::OnFailure.fires(false, false));
    }

    #[test]
    fn deserializes_with_defaults() {
        let def: JobDefinition = serde_json::from_value(json!({
            "name": "nightly",
            "entries": [
                { "name": "start", "type": "START" },
                { "name": "load", "type": "PIPELINE", "parallel": true }
            ],
            "hops": [
                { "from": "start", "to": "load" },
                { "from": "load", "to": "start", "condition": "on_failure", "enabled": false }
            ]
        }))
        .unwrap();

        assert_eq!(def.start, None);
        assert!(def.entries[0].reset_errors);
        assert!(def.entries[1].parallel);
        assert_eq!(def.entries[1].evaluates, None);
        assert_eq!(def.hops[0].condition, HopCondition::Unconditional);
        assert_eq!(def.hops[1].condition, HopCondition::OnFailure);
        assert!(!def.hops[1].enabled);
    }
}

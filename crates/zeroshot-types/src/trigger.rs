use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    ExecuteTask,
    StopCluster,
}

/// A `(topic, action, optional gating logic)` rule owned by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub topic: String,
    pub action: TriggerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
}

impl Trigger {
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.topic == topic
    }
}

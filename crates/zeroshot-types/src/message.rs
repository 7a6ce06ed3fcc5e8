use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who a message is addressed to. `Broadcast` and `System` are synthetic
/// receivers; any other value names a concrete agent id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Receiver {
    Broadcast,
    System,
    Agent(String),
}

impl Receiver {
    pub fn agent(id: impl Into<String>) -> Self {
        Receiver::Agent(id.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            data: None,
        }
    }

    pub fn data(data: Value) -> Self {
        Self {
            text: None,
            data: Some(data),
        }
    }
}

/// A single append-only ledger entry. Immutable once appended; `timestamp`
/// is assigned by the ledger on publish if not already set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub cluster_id: String,
    pub topic: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_model: Option<String>,
    pub receiver: Receiver,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(
        cluster_id: impl Into<String>,
        topic: impl Into<String>,
        sender: impl Into<String>,
        receiver: Receiver,
        content: MessageContent,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            topic: topic.into(),
            sender: sender.into(),
            sender_model: None,
            receiver,
            timestamp: None,
            content,
            metadata: None,
        }
    }

    pub fn with_sender_model(mut self, model: impl Into<String>) -> Self {
        self.sender_model = Some(model.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Conjunctive filter used by `ledger.query` / `findLast` / `count` / `since`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub cluster_id: Option<String>,
    pub topic: Option<String>,
    pub sender: Option<String>,
    /// strictly-greater-than timestamp bound
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn for_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(cluster_id) = &self.cluster_id {
            if &message.cluster_id != cluster_id {
                return false;
            }
        }
        if let Some(topic) = &self.topic {
            if &message.topic != topic {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.timestamp.unwrap_or(0) <= since {
                return false;
            }
        }
        true
    }
}

// Well-known topic names used by the engine itself. Operator-defined
// topics are plain strings; these constants exist so internal publishers
// and the agent state machine agree on spelling.
pub mod topics {
    pub const ISSUE_OPENED: &str = "ISSUE_OPENED";
    pub const AGENT_RESUME: &str = "AGENT_RESUME";
    pub const AGENT_OUTPUT: &str = "AGENT_OUTPUT";
    pub const PROCESS_SPAWNED: &str = "PROCESS_SPAWNED";
    pub const TASK_ID_ASSIGNED: &str = "TASK_ID_ASSIGNED";
    pub const TASK_STARTED: &str = "TASK_STARTED";
    pub const TASK_COMPLETED: &str = "TASK_COMPLETED";
    pub const TOKEN_USAGE: &str = "TOKEN_USAGE";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const AGENT_SCHEMA_WARNING: &str = "AGENT_SCHEMA_WARNING";
    pub const AGENT_STALE_WARNING: &str = "AGENT_STALE_WARNING";
    pub const CLUSTER_COMPLETE: &str = "CLUSTER_COMPLETE";
    pub const CLUSTER_FAILED: &str = "CLUSTER_FAILED";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_is_conjunctive() {
        let mut msg = Message::new(
            "c1",
            "TASK_COMPLETE",
            "worker",
            Receiver::Broadcast,
            MessageContent::text("done"),
        );
        msg.timestamp = Some(100);

        let filter = MessageFilter::for_cluster("c1")
            .with_topic("TASK_COMPLETE")
            .with_since(50);
        assert!(filter.matches(&msg));

        let filter_wrong_topic = MessageFilter::for_cluster("c1").with_topic("OTHER");
        assert!(!filter_wrong_topic.matches(&msg));

        let filter_since_excludes = MessageFilter::for_cluster("c1").with_since(100);
        assert!(!filter_since_excludes.matches(&msg));
    }
}

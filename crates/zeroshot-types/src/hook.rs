use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Receiver;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishMessageConfig {
    pub topic: String,
    #[serde(default = "default_receiver")]
    pub receiver: Receiver,
    pub content: Value,
}

fn default_receiver() -> Receiver {
    Receiver::Broadcast
}

/// A declarative post-event action run on `onStart` / `onComplete` /
/// `onError`. `content`/`args` may embed `{{result.path}}` placeholders
/// resolved against the parsed task result before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Hook {
    PublishMessage { config: PublishMessageConfig },
    RunScript { command: String, args: Vec<String> },
    EvaluateLogic { script: String },
}

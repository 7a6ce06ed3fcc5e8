//! Assembles the prompt string handed to a task runner invocation.
//!
//! Deterministic given the same ledger contents, agent config, and
//! triggering message: no randomness, no wall-clock reads beyond the
//! `now` an agent passes in explicitly for symbolic `since` resolution.

use chrono::{TimeZone, Utc};

use zeroshot_ledger::Ledger;
use zeroshot_types::{
    topics, Agent, ContextSource, Message, MessageFilter, SinceSpec, SinceSymbol,
};

pub const MAX_CONTEXT_CHARS: usize = 500_000;

const AUTONOMOUS_PREAMBLE: &str = "\
You are operating autonomously with no human in the loop. Make decisions \
and proceed; do not pause to ask clarifying questions.";

const MINIMAL_OUTPUT_PREAMBLE: &str = "\
Keep narration minimal. Produce only the output the task calls for.";

const GIT_FORBIDDEN_PREAMBLE: &str = "\
You are running directly on the host repository outside of any worktree \
or container isolation. Do not run git commands that create commits, \
branches, or otherwise mutate repository history.";

/// Everything `ContextBuilder::build` needs beyond the ledger itself.
pub struct ContextInputs<'a> {
    pub agent: &'a Agent,
    pub cluster_created_at_ms: i64,
    pub isolation_enabled: bool,
    pub worktree_enabled: bool,
    pub prompt: &'a str,
    pub triggering_message: &'a Message,
    /// Legacy secondary ceiling; `None` disables it.
    pub max_tokens: Option<u32>,
}

pub struct ContextBuilder<'a> {
    ledger: &'a Ledger,
}

struct RenderedMessage {
    topic: String,
    timestamp: i64,
    line: String,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self { ledger }
    }

    pub async fn build(&self, inputs: &ContextInputs<'_>) -> String {
        let prefix = build_prefix(inputs);
        let triggering_block = render_triggering_message(inputs.triggering_message);

        let mut issue_opened_block: Option<String> = None;
        let mut rest: Vec<RenderedMessage> = Vec::new();

        for source in &inputs.agent.config.context_strategy.sources {
            let since = resolve_since(&source.since, inputs);
            let mut filter = MessageFilter::for_cluster(inputs.agent.cluster_id.clone())
                .with_topic(source.topic.clone())
                .with_since(since);
            if let Some(sender) = &source.sender {
                filter = filter.with_sender(sender.clone());
            }
            if let Some(limit) = source.limit {
                filter = filter.with_limit(limit);
            }
            let messages = self.ledger.query(&filter).await;
            if messages.is_empty() {
                continue;
            }

            if source.topic == topics::ISSUE_OPENED && issue_opened_block.is_none() {
                issue_opened_block = Some(render_topic_block(&source.topic, &messages));
                continue;
            }

            let mut bucket: Vec<RenderedMessage> = messages
                .iter()
                .map(|message| RenderedMessage {
                    topic: source.topic.clone(),
                    timestamp: message.timestamp.unwrap_or(0),
                    line: render_message_line(message),
                })
                .collect();
            bucket.sort_by_key(|m| m.timestamp);
            rest.extend(bucket);
        }

        let full = format!(
            "{prefix}{}{}{}",
            issue_opened_block.as_deref().unwrap_or(""),
            render_grouped(&rest),
            triggering_block
        );

        let assembled = if full.len() <= MAX_CONTEXT_CHARS {
            full
        } else {
            truncate_middle(&prefix, issue_opened_block.as_deref(), &rest, &triggering_block)
        };

        apply_legacy_ceiling(assembled, inputs.max_tokens)
    }
}

fn build_prefix(inputs: &ContextInputs<'_>) -> String {
    let mut prefix = String::new();
    prefix.push_str(&format!(
        "# Agent: {} (role: {})\n# Iteration: {}\n\n",
        inputs.agent.id, inputs.agent.config.role, inputs.agent.iteration
    ));
    prefix.push_str(AUTONOMOUS_PREAMBLE);
    prefix.push_str("\n\n");
    prefix.push_str(MINIMAL_OUTPUT_PREAMBLE);
    prefix.push_str("\n\n");
    if !inputs.isolation_enabled && !inputs.worktree_enabled {
        prefix.push_str(GIT_FORBIDDEN_PREAMBLE);
        prefix.push_str("\n\n");
    }
    prefix.push_str(inputs.prompt);
    prefix.push_str("\n\n");
    prefix
}

fn resolve_since(spec: &SinceSpec, inputs: &ContextInputs<'_>) -> i64 {
    match spec {
        SinceSpec::Timestamp(ts) => *ts,
        SinceSpec::Symbol(SinceSymbol::ClusterStart) => inputs.cluster_created_at_ms,
        SinceSpec::Symbol(SinceSymbol::LastTaskEnd) => inputs
            .agent
            .last_task_end_time
            .unwrap_or(inputs.cluster_created_at_ms),
    }
}

fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn render_message_line(message: &Message) -> String {
    let mut line = format!(
        "- [{}] {}: {}\n",
        format_timestamp(message.timestamp.unwrap_or(0)),
        message.sender,
        message.content.text.as_deref().unwrap_or("")
    );
    if let Some(data) = &message.content.data {
        if let Ok(pretty) = serde_json::to_string_pretty(data) {
            line.push_str("  data: ");
            line.push_str(&pretty);
            line.push('\n');
        }
    }
    line
}

fn render_topic_block(topic: &str, messages: &[Message]) -> String {
    let mut block = format!("## Messages from topic: {topic}\n\n");
    for message in messages {
        block.push_str(&render_message_line(message));
    }
    block.push('\n');
    block
}

/// Renders a recency-sorted, cross-topic set of messages as blocks,
/// emitting a new `## Messages from topic: T` header whenever the topic
/// changes from the previous surviving line. Never reorders its input.
fn render_grouped(messages: &[RenderedMessage]) -> String {
    let mut out = String::new();
    let mut current_topic: Option<&str> = None;
    for message in messages {
        if current_topic != Some(message.topic.as_str()) {
            if current_topic.is_some() {
                out.push('\n');
            }
            out.push_str(&format!("## Messages from topic: {}\n\n", message.topic));
            current_topic = Some(message.topic.as_str());
        }
        out.push_str(&message.line);
    }
    if current_topic.is_some() {
        out.push('\n');
    }
    out
}

fn render_triggering_message(message: &Message) -> String {
    let mut block = "## Triggering Message\n\n".to_string();
    block.push_str(&render_message_line(message));
    block
}

/// Drops the oldest surviving messages from `rest` until the assembled
/// context (prefix + preserved `ISSUE_OPENED` block + surviving middle +
/// triggering block + truncation marker) fits within `MAX_CONTEXT_CHARS`.
fn truncate_middle(
    prefix: &str,
    issue_opened_block: Option<&str>,
    rest: &[RenderedMessage],
    triggering_block: &str,
) -> String {
    let issue_opened_block = issue_opened_block.unwrap_or("");
    let fixed_len = prefix.len() + issue_opened_block.len() + triggering_block.len();

    let mut dropped = 0;
    let mut start = 0;
    loop {
        let marker = if dropped > 0 {
            format!("[...{dropped} earlier context messages truncated...]\n\n")
        } else {
            String::new()
        };
        let surviving = &rest[start..];
        let middle_len: usize = surviving.iter().map(|m| m.line.len()).sum();
        let header_overhead = if surviving.is_empty() {
            0
        } else {
            surviving
                .iter()
                .map(|m| m.topic.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .iter()
                .map(|t| format!("## Messages from topic: {t}\n\n\n").len())
                .sum()
        };

        if fixed_len + marker.len() + header_overhead + middle_len <= MAX_CONTEXT_CHARS
            || start >= rest.len()
        {
            let mut out = String::new();
            out.push_str(prefix);
            out.push_str(issue_opened_block);
            out.push_str(&marker);
            out.push_str(&render_grouped(surviving));
            out.push_str(triggering_block);
            return out;
        }

        start += 1;
        dropped += 1;
    }
}

fn apply_legacy_ceiling(context: String, max_tokens: Option<u32>) -> String {
    let Some(max_tokens) = max_tokens else {
        return context;
    };
    let cap = (max_tokens as usize) * 4;
    if context.len() <= cap {
        return context;
    }
    let mut clipped = context;
    clipped.truncate(cap);
    clipped.push_str("\n[Context truncated...]\n");
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroshot_types::{
        AgentConfig, AgentState, ContextStrategy, ModelConfig, PromptConfig, Receiver,
    };
    use zeroshot_types::MessageContent;

    fn agent_with_sources(sources: Vec<ContextSource>) -> Agent {
        let config = AgentConfig {
            role: "worker".into(),
            model: ModelConfig::Static {
                model: "sonnet".into(),
            },
            prompt: PromptConfig::Literal("do the thing".into()),
            triggers: Vec::new(),
            context_strategy: ContextStrategy { sources },
            output_format: Default::default(),
            max_iterations: 10,
            max_retries: 1,
            timeout_ms: 0,
            on_start: None,
            on_complete: None,
            on_error: None,
        };
        let mut agent = Agent::new("worker-1", "c1", config);
        agent.state = AgentState::BuildingContext;
        agent.iteration = 1;
        agent
    }

    fn triggering() -> Message {
        Message::new(
            "c1",
            "ISSUE_OPENED",
            "system",
            Receiver::Broadcast,
            MessageContent::text("Do X"),
        )
    }

    #[tokio::test]
    async fn triggering_message_block_is_byte_identical_to_its_construction() {
        let ledger = Ledger::new("c1");
        let agent = agent_with_sources(vec![]);
        let trigger = triggering();
        let builder = ContextBuilder::new(&ledger);
        let inputs = ContextInputs {
            agent: &agent,
            cluster_created_at_ms: 0,
            isolation_enabled: false,
            worktree_enabled: false,
            prompt: "do the thing",
            triggering_message: &trigger,
            max_tokens: None,
        };
        let out = builder.build(&inputs).await;
        let expected = render_triggering_message(&trigger);
        let idx = out.find("## Triggering Message").unwrap();
        assert_eq!(&out[idx..], expected);
    }

    #[tokio::test]
    async fn git_forbidden_preamble_only_when_unisolated() {
        let ledger = Ledger::new("c1");
        let agent = agent_with_sources(vec![]);
        let trigger = triggering();
        let builder = ContextBuilder::new(&ledger);

        let mut inputs = ContextInputs {
            agent: &agent,
            cluster_created_at_ms: 0,
            isolation_enabled: false,
            worktree_enabled: false,
            prompt: "do the thing",
            triggering_message: &trigger,
            max_tokens: None,
        };
        let out = builder.build(&inputs).await;
        assert!(out.contains(GIT_FORBIDDEN_PREAMBLE));

        inputs.worktree_enabled = true;
        let out = builder.build(&inputs).await;
        assert!(!out.contains(GIT_FORBIDDEN_PREAMBLE));
    }

    #[tokio::test]
    async fn issue_opened_survives_truncation_verbatim() {
        let ledger = Ledger::new("c1");
        let issue = Message::new(
            "c1",
            topics::ISSUE_OPENED,
            "system",
            Receiver::Broadcast,
            MessageContent::text("Do X"),
        );
        let stamped_issue = ledger.publish(issue).await;

        for i in 0..2000 {
            let filler = Message::new(
                "c1",
                "CHATTER",
                "worker",
                Receiver::Broadcast,
                MessageContent::text("x".repeat(500)),
            );
            let mut filler = filler;
            filler.timestamp = Some(i + 1);
            ledger.publish(filler).await;
        }

        let agent = agent_with_sources(vec![
            ContextSource {
                topic: topics::ISSUE_OPENED.into(),
                sender: None,
                since: SinceSpec::Timestamp(0),
                limit: None,
            },
            ContextSource {
                topic: "CHATTER".into(),
                sender: None,
                since: SinceSpec::Timestamp(0),
                limit: None,
            },
        ]);
        let trigger = triggering();
        let builder = ContextBuilder::new(&ledger);
        let inputs = ContextInputs {
            agent: &agent,
            cluster_created_at_ms: 0,
            isolation_enabled: true,
            worktree_enabled: false,
            prompt: "do the thing",
            triggering_message: &trigger,
            max_tokens: None,
        };

        let out = builder.build(&inputs).await;
        assert!(out.len() <= MAX_CONTEXT_CHARS);
        assert!(out.contains(stamped_issue.content.text.as_ref().unwrap()));
        assert!(out.contains("earlier context messages truncated"));
    }

    #[tokio::test]
    async fn legacy_ceiling_clips_tail_with_suffix() {
        let ledger = Ledger::new("c1");
        let agent = agent_with_sources(vec![]);
        let trigger = triggering();
        let builder = ContextBuilder::new(&ledger);
        let inputs = ContextInputs {
            agent: &agent,
            cluster_created_at_ms: 0,
            isolation_enabled: true,
            worktree_enabled: false,
            prompt: &"y".repeat(10_000),
            triggering_message: &trigger,
            max_tokens: Some(10),
        };
        let out = builder.build(&inputs).await;
        assert!(out.len() <= 40 + "\n[Context truncated...]\n".len());
        assert!(out.ends_with("[Context truncated...]\n"));
    }

    #[tokio::test]
    async fn distinct_topic_sources_are_not_interleaved_into_alternating_blocks() {
        let ledger = Ledger::new("c1");

        for i in 0..5 {
            let mut message = Message::new(
                "c1",
                "ALPHA",
                "worker",
                Receiver::Broadcast,
                MessageContent::text(format!("alpha {i}")),
            );
            message.timestamp = Some(i * 2);
            ledger.publish(message).await;

            let mut message = Message::new(
                "c1",
                "BETA",
                "worker",
                Receiver::Broadcast,
                MessageContent::text(format!("beta {i}")),
            );
            message.timestamp = Some(i * 2 + 1);
            ledger.publish(message).await;
        }

        let agent = agent_with_sources(vec![
            ContextSource {
                topic: "ALPHA".into(),
                sender: None,
                since: SinceSpec::Timestamp(0),
                limit: None,
            },
            ContextSource {
                topic: "BETA".into(),
                sender: None,
                since: SinceSpec::Timestamp(0),
                limit: None,
            },
        ]);
        let trigger = triggering();
        let builder = ContextBuilder::new(&ledger);
        let inputs = ContextInputs {
            agent: &agent,
            cluster_created_at_ms: 0,
            isolation_enabled: true,
            worktree_enabled: false,
            prompt: "do the thing",
            triggering_message: &trigger,
            max_tokens: None,
        };

        let out = builder.build(&inputs).await;
        let alpha_header = "## Messages from topic: ALPHA";
        let beta_header = "## Messages from topic: BETA";
        assert_eq!(out.matches(alpha_header).count(), 1);
        assert_eq!(out.matches(beta_header).count(), 1);
        assert!(out.find(alpha_header).unwrap() < out.find(beta_header).unwrap());
    }
}

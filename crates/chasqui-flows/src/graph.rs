//! Flow graphs: nodes, symbolic handles, edges, and structural validation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FlowError, Result};
use crate::node::{NodeKind, DELAY_MAX_SECS, DELAY_MIN_SECS};

/// Symbolic outgoing edge slots.
pub mod handle {
    pub const DEFAULT: &str = "out:default";
    pub const MATCH: &str = "out:match";
    pub const NO_MATCH: &str = "out:no_match";
    pub const ERROR: &str = "out:error";
    pub const SUCCESS: &str = "out:success";
    pub const IN_HOURS: &str = "out:in_hours";
    pub const OUT_OF_HOURS: &str = "out:out_of_hours";

    pub fn option(index: usize) -> String {
        format!("out:option:{index}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Seconds to pause before this node materializes its output.
    #[serde(default)]
    pub delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    pub from_node: String,
    pub from_handle: String,
    pub to_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<Edge>,
    /// Minutes before the bot-timeout scheduler gives up on this flow.
    #[serde(default = "default_bot_timeout")]
    pub bot_timeout_minutes: u32,
    /// Where timed-out or errored conversations go.
    #[serde(default)]
    pub fallback_queue_id: Option<String>,
    /// Author opt-in: keep nodes no edge can reach.
    #[serde(default)]
    pub allow_unreachable: bool,
}

fn default_version() -> u32 {
    1
}
fn default_bot_timeout() -> u32 {
    30
}

impl FlowDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    /// Follow `handle` out of `node_id`.
    pub fn successor(&self, node_id: &str, handle: &str) -> Option<&FlowNode> {
        let edge = self
            .edges
            .iter()
            .find(|e| e.from_node == node_id && e.from_handle == handle)?;
        self.node(&edge.to_node)
    }

    pub fn has_handle(&self, node_id: &str, handle: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.from_node == node_id && e.from_handle == handle)
    }

    /// Structural validation. Collects every problem before failing.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        let start_count = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .count();
        if start_count != 1 {
            problems.push(format!("expected exactly one start node, found {start_count}"));
        }

        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            problems.push("duplicate node ids".into());
        }

        for edge in &self.edges {
            if !ids.contains(edge.from_node.as_str()) {
                problems.push(format!("edge from unknown node '{}'", edge.from_node));
                continue;
            }
            if !ids.contains(edge.to_node.as_str()) {
                problems.push(format!("edge to unknown node '{}'", edge.to_node));
            }
            let node = self.node(&edge.from_node).expect("checked above");
            if !allowed_handles(node).contains(&edge.from_handle) {
                problems.push(format!(
                    "node '{}' ({}) has no handle '{}'",
                    edge.from_node,
                    node.kind.name(),
                    edge.from_handle
                ));
            }
        }

        for node in &self.nodes {
            self.validate_node(node, &mut problems);
        }

        if !self.allow_unreachable {
            for id in self.unreachable_nodes() {
                problems.push(format!("node '{id}' is unreachable from start"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Invalid(problems))
        }
    }

    fn validate_node(&self, node: &FlowNode, problems: &mut Vec<String>) {
        match &node.kind {
            NodeKind::Delay(delay) => {
                if !(DELAY_MIN_SECS..=DELAY_MAX_SECS).contains(&delay.delay_seconds) {
                    problems.push(format!(
                        "node '{}': delay_seconds {} outside {}..={}",
                        node.id, delay.delay_seconds, DELAY_MIN_SECS, DELAY_MAX_SECS
                    ));
                }
            }
            NodeKind::Buttons(b) if b.options.is_empty() => {
                problems.push(format!("node '{}': buttons node needs options", node.id));
            }
            NodeKind::Menu(m) if m.options.is_empty() => {
                problems.push(format!("node '{}': menu node needs options", node.id));
            }
            NodeKind::Question(q) if q.var_name.trim().is_empty() => {
                problems.push(format!("node '{}': question needs a var_name", node.id));
            }
            NodeKind::Scheduler(s) => {
                if s.source == crate::node::ScheduleSource::Crm && s.queue_type.is_none() {
                    problems.push(format!(
                        "node '{}': crm-sourced scheduler needs queue_type",
                        node.id
                    ));
                }
            }
            NodeKind::WebhookOut(w) if w.url.trim().is_empty() => {
                problems.push(format!("node '{}': webhook_out needs a url", node.id));
            }
            NodeKind::Transfer(t) if t.queue_id.trim().is_empty() => {
                problems.push(format!("node '{}': transfer needs a queue_id", node.id));
            }
            _ => {}
        }

        if let Some(delay) = node.delay_seconds {
            if !(DELAY_MIN_SECS..=DELAY_MAX_SECS).contains(&delay) {
                problems.push(format!(
                    "node '{}': delay_seconds {} outside {}..={}",
                    node.id, delay, DELAY_MIN_SECS, DELAY_MAX_SECS
                ));
            }
        }
    }

    fn unreachable_nodes(&self) -> Vec<String> {
        let Some(start) = self.start_node() else {
            return Vec::new();
        };
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.from_node.as_str())
                .or_default()
                .push(edge.to_node.as_str());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(start.id.as_str());
        queue.push_back(start.id.as_str());
        while let Some(current) = queue.pop_front() {
            for next in adjacency.get(current).into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        self.nodes
            .iter()
            .filter(|n| !seen.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect()
    }
}

/// The handles a node kind may legally carry edges from.
pub fn allowed_handles(node: &FlowNode) -> Vec<String> {
    use handle::*;
    match &node.kind {
        NodeKind::Start
        | NodeKind::Message(_)
        | NodeKind::Attachment(_)
        | NodeKind::Delay(_)
        | NodeKind::WebhookIn => vec![DEFAULT.to_string()],
        NodeKind::Buttons(b) => {
            let mut handles: Vec<String> = (0..b.options.len()).map(option).collect();
            handles.push(ERROR.to_string());
            handles
        }
        NodeKind::Menu(m) => {
            let mut handles: Vec<String> = (0..m.options.len()).map(option).collect();
            handles.push(ERROR.to_string());
            handles
        }
        NodeKind::Question(_) => vec![DEFAULT.to_string(), ERROR.to_string()],
        NodeKind::Validation(_) => vec![
            MATCH.to_string(),
            NO_MATCH.to_string(),
            ERROR.to_string(),
        ],
        NodeKind::Condition(_) => vec![DEFAULT.to_string(), NO_MATCH.to_string()],
        NodeKind::Scheduler(_) => vec![IN_HOURS.to_string(), OUT_OF_HOURS.to_string()],
        NodeKind::WebhookOut(_) => vec![SUCCESS.to_string(), ERROR.to_string()],
        NodeKind::Agent(_) => vec![ERROR.to_string()],
        NodeKind::Transfer(_) | NodeKind::End(_) => Vec::new(),
    }
}

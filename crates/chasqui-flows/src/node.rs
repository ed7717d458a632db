//! The node catalogue. Every kind is a tagged variant with a fixed payload
//! schema; unknown fields in a payload are rejected at load time.
//!
//! Wire shape: `{ "id": "n1", "label": "…", "kind": "message",
//! "data": { … }, "delay_seconds": 2 }`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Message(MessageNode),
    Buttons(ButtonsNode),
    Menu(MenuNode),
    Question(QuestionNode),
    Validation(ValidationNode),
    Condition(ConditionNode),
    Attachment(AttachmentNode),
    Delay(DelayNode),
    Scheduler(SchedulerNode),
    WebhookOut(WebhookOutNode),
    WebhookIn,
    Transfer(TransferNode),
    End(EndNode),
    Agent(AgentNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Message(_) => "message",
            NodeKind::Buttons(_) => "buttons",
            NodeKind::Menu(_) => "menu",
            NodeKind::Question(_) => "question",
            NodeKind::Validation(_) => "validation",
            NodeKind::Condition(_) => "condition",
            NodeKind::Attachment(_) => "attachment",
            NodeKind::Delay(_) => "delay",
            NodeKind::Scheduler(_) => "scheduler",
            NodeKind::WebhookOut(_) => "webhook_out",
            NodeKind::WebhookIn => "webhook_in",
            NodeKind::Transfer(_) => "transfer",
            NodeKind::End(_) => "end",
            NodeKind::Agent(_) => "agent",
        }
    }

    /// Terminal nodes end the macro-step with no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Transfer(_) | NodeKind::End(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MessageNode {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NodeOption {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ButtonsNode {
    pub prompt: String,
    pub options: Vec<NodeOption>,
    #[serde(default)]
    pub retry_message: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MenuMode {
    #[default]
    Interactive,
    /// The prompt lists numbered options; the user types the digit.
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MenuNode {
    pub prompt: String,
    pub options: Vec<NodeOption>,
    #[serde(default)]
    pub mode: MenuMode,
    #[serde(default)]
    pub retry_message: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionInput {
    #[default]
    Text,
    Media,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QuestionNode {
    pub prompt: String,
    pub var_name: String,
    #[serde(default)]
    pub input: QuestionInput,
    #[serde(default)]
    pub validation: Option<ValidationMode>,
    #[serde(default)]
    pub retry_message: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ValidationNode {
    pub mode: ValidationMode,
}

/// Pure predicate over the last user input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", content = "config", rename_all = "snake_case")]
pub enum ValidationMode {
    Keywords(KeywordsConfig),
    Format(FormatConfig),
    Variable(VariableConfig),
    Range(RangeConfig),
    Length(LengthConfig),
    Regex(RegexConfig),
    OptionsList(OptionsListConfig),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupCombine {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatch {
    Contains,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeywordGroup {
    pub mode: KeywordMatch,
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeywordsConfig {
    pub groups: Vec<KeywordGroup>,
    pub combine: GroupCombine,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormatPattern {
    Email,
    Phone,
    /// Peruvian national id: exactly 8 digits.
    Dni,
    /// Peruvian tax id: exactly 11 digits.
    Ruc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    pub pattern: FormatPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VariableConfig {
    pub name: String,
    /// When absent, the input must equal the variable's current value.
    #[serde(default)]
    pub equals: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LengthConfig {
    #[serde(default)]
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegexConfig {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OptionsListConfig {
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleCombine {
    All,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RuleSubject {
    UserMessage,
    Variable { name: String },
    Keyword,
    CrmField { field: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    StartsWith,
}

// No deny_unknown_fields here: serde cannot combine it with `flatten`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionRule {
    #[serde(flatten)]
    pub subject: RuleSubject,
    pub operator: RuleOperator,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConditionNode {
    pub rules: Vec<ConditionRule>,
    pub combine: RuleCombine,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    Video,
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AttachmentNode {
    /// Public HTTPS URL or pre-uploaded provider media id.
    pub source: String,
    pub media_type: AttachmentKind,
    #[serde(default)]
    pub caption: Option<String>,
}

pub const DELAY_MIN_SECS: u64 = 1;
pub const DELAY_MAX_SECS: u64 = 345_600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DelayNode {
    pub delay_seconds: u64,
    /// When true, an inbound user message cancels the wait and the flow
    /// advances immediately. Default: the delay runs to completion.
    #[serde(default)]
    pub interruptible: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSource {
    Queue,
    Crm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerNode {
    pub source: ScheduleSource,
    /// Queue whose schedule applies; defaults to the conversation's queue.
    #[serde(default)]
    pub queue_id: Option<String>,
    /// CRM queue type when `source = crm`.
    #[serde(default)]
    pub queue_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WebhookOutNode {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body template; `{{var}}` tokens substitute in string values.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// variable name → JSON pointer into the response body.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransferNode {
    pub queue_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EndNode {
    #[serde(default)]
    pub close_conversation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentNode {
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_node_parses() {
        let json = r#"{"kind": "message", "data": {"text": "Hola {{nombre}}"}}"#;
        let kind: NodeKind = serde_json::from_str(json).unwrap();
        assert!(matches!(kind, NodeKind::Message(MessageNode { ref text }) if text.contains("nombre")));
    }

    #[test]
    fn unit_kinds_need_no_data() {
        let start: NodeKind = serde_json::from_str(r#"{"kind": "start"}"#).unwrap();
        assert_eq!(start, NodeKind::Start);
        let park: NodeKind = serde_json::from_str(r#"{"kind": "webhook_in"}"#).unwrap();
        assert_eq!(park, NodeKind::WebhookIn);
    }

    #[test]
    fn unknown_payload_fields_rejected() {
        let json = r#"{"kind": "message", "data": {"text": "x", "colour": "red"}}"#;
        assert!(serde_json::from_str::<NodeKind>(json).is_err());
    }

    #[test]
    fn validation_modes_parse() {
        let json = r#"{
          "mode": "keywords",
          "config": {
            "combine": "or",
            "groups": [{"mode": "contains", "terms": ["precio", "costo"]}]
          }
        }"#;
        let mode: ValidationMode = serde_json::from_str(json).unwrap();
        assert!(matches!(mode, ValidationMode::Keywords(_)));

        let json = r#"{"mode": "format", "config": {"pattern": "email"}}"#;
        let mode: ValidationMode = serde_json::from_str(json).unwrap();
        assert!(matches!(
            mode,
            ValidationMode::Format(FormatConfig { pattern: FormatPattern::Email })
        ));
    }

    #[test]
    fn condition_rule_sources_parse() {
        let json = r#"{"source": "variable", "name": "ciudad", "operator": "equals", "value": "Lima"}"#;
        let rule: ConditionRule = serde_json::from_str(json).unwrap();
        assert!(matches!(rule.subject, RuleSubject::Variable { ref name } if name == "ciudad"));

        let json = r#"{"source": "user_message", "operator": "contains", "value": "precio"}"#;
        let rule: ConditionRule = serde_json::from_str(json).unwrap();
        assert!(matches!(rule.subject, RuleSubject::UserMessage));
    }

    #[test]
    fn delay_defaults_to_non_interruptible() {
        let json = r#"{"kind": "delay", "data": {"delay_seconds": 30}}"#;
        let NodeKind::Delay(delay) = serde_json::from_str::<NodeKind>(json).unwrap() else {
            panic!("expected delay");
        };
        assert!(!delay.interruptible);
    }
}

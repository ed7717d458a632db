//! Condition-node evaluation: n rules over user message, session
//! variables, keywords or CRM fields, combined all/any.

use chasqui_flows::node::{ConditionNode, RuleCombine, RuleOperator, RuleSubject};
use serde_json::{Map, Value};

pub fn evaluate(
    node: &ConditionNode,
    last_input: &str,
    variables: &Map<String, Value>,
    crm_fields: Option<&Map<String, Value>>,
) -> bool {
    let rule_hit = |rule: &chasqui_flows::node::ConditionRule| {
        let subject: Option<String> = match &rule.subject {
            RuleSubject::UserMessage | RuleSubject::Keyword => Some(last_input.to_string()),
            RuleSubject::Variable { name } => variables.get(name).map(render),
            RuleSubject::CrmField { field } => {
                crm_fields.and_then(|f| f.get(field)).map(render)
            }
        };
        let Some(subject) = subject else {
            return false;
        };
        apply(&fold(&subject), rule.operator, &fold(&rule.value))
    };

    match node.combine {
        RuleCombine::All => node.rules.iter().all(rule_hit),
        RuleCombine::Any => node.rules.iter().any(rule_hit),
    }
}

fn apply(subject: &str, operator: RuleOperator, value: &str) -> bool {
    match operator {
        RuleOperator::Equals => subject == value,
        RuleOperator::NotEquals => subject != value,
        RuleOperator::Contains => subject.contains(value),
        RuleOperator::StartsWith => subject.starts_with(value),
    }
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

//! Token substitution at materialization time.
//!
//! `{{entity:FIELD}}` reads the CRM contact field map; `{{name}}` reads a
//! session variable. Unknown tokens stay literal so flow authors can see
//! the miss in the delivered text.

use serde_json::{Map, Value};

pub fn substitute(
    template: &str,
    variables: &Map<String, Value>,
    crm_fields: Option<&Map<String, Value>>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // unclosed token, keep the remainder literally
            out.push_str(&rest[start..]);
            return out;
        };
        let token = after[..end].trim();
        match resolve(token, variables, crm_fields) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve(
    token: &str,
    variables: &Map<String, Value>,
    crm_fields: Option<&Map<String, Value>>,
) -> Option<String> {
    if let Some(field) = token.strip_prefix("entity:") {
        return crm_fields?.get(field.trim()).map(render);
    }
    variables.get(token).map(render)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("nombre".into(), json!("Ana"));
        m.insert("pedidos".into(), json!(3));
        m
    }

    fn crm() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("COMPANY".into(), json!("Ferretería Díaz"));
        m
    }

    #[test]
    fn substitutes_variables_and_entities() {
        let out = substitute(
            "Hola {{nombre}} de {{entity:COMPANY}}, tienes {{pedidos}} pedidos",
            &vars(),
            Some(&crm()),
        );
        assert_eq!(out, "Hola Ana de Ferretería Díaz, tienes 3 pedidos");
    }

    #[test]
    fn missing_tokens_stay_literal() {
        let out = substitute("Hola {{nombre}}, {{apellido}}", &vars(), None);
        assert_eq!(out, "Hola Ana, {{apellido}}");
        let out = substitute("{{entity:RUC}}", &vars(), Some(&crm()));
        assert_eq!(out, "{{entity:RUC}}");
        // entity token without CRM context stays literal too
        let out = substitute("{{entity:COMPANY}}", &vars(), None);
        assert_eq!(out, "{{entity:COMPANY}}");
    }

    #[test]
    fn unclosed_token_kept_verbatim() {
        let out = substitute("Hola {{nombre", &vars(), None);
        assert_eq!(out, "Hola {{nombre");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(substitute("sin tokens", &vars(), None), "sin tokens");
    }
}

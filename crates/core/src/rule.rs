//! Declarative field rule: a flag produced from a JSON pointer into the payload.
//!
//! Header, body and action targets may embed `{/json/pointer}` placeholders
//! that are substituted from the payload document.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FlagAction, FlagDescriptor, Severity};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    /// JSON pointer (RFC 6901) selecting the watched field, e.g. `/billing/overdue`.
    pub pointer: String,
    /// When set the field must equal this value; otherwise it must be present and non-null.
    #[serde(default)]
    pub equals: Option<Value>,
    #[serde(default)]
    pub severity: Severity,
    pub header: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub actions: Vec<FlagAction>,
}

impl FieldRule {
    pub fn validate(&self) -> Result<()> {
        if !self.pointer.is_empty() && !self.pointer.starts_with('/') {
            return Err(anyhow!("invalid pointer {:?}: must be empty or start with '/'", self.pointer));
        }
        if self.header.trim().is_empty() { return Err(anyhow!("rule header is empty")); }
        Ok(())
    }

    /// Evaluate against a payload document. `Ok(None)` when the rule does not fire.
    pub fn evaluate(&self, doc: &Value) -> Result<Option<FlagDescriptor>> {
        self.validate()?;
        let field = match doc.pointer(&self.pointer) {
            Some(Value::Null) | None => return Ok(None),
            Some(v) => v,
        };
        if let Some(expected) = &self.equals {
            if field != expected { return Ok(None); }
        }
        let header = render(&self.header, doc);
        if header.trim().is_empty() {
            return Err(anyhow!("rule header rendered empty for pointer {}", self.pointer));
        }
        let mut flag = FlagDescriptor::new(self.severity, header);
        flag.body = self.body.as_deref().map(|b| render(b, doc));
        for a in &self.actions {
            flag.actions.push(FlagAction { label: render(&a.label, doc), target: render(&a.target, doc) });
        }
        Ok(Some(flag))
    }
}

fn scalar_text(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Substitute `{/pointer}` placeholders; unknown pointers render empty.
pub fn render(template: &str, doc: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{/") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&scalar_text(doc.pointer(&after[..end])));
                rest = &after[end + 1..];
            }
            None => {
                // unterminated: keep verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pointer: &str, equals: Option<Value>) -> FieldRule {
        FieldRule {
            pointer: pointer.into(),
            equals,
            severity: Severity::Warning,
            header: "Overdue since {/billing/since}".into(),
            body: Some("Owner: {/owner/name} ({/missing})".into()),
            actions: vec![FlagAction { label: "Open".into(), target: "/accounts/{/id}".into() }],
        }
    }

    fn doc() -> Value {
        serde_json::json!({
            "id": "001A",
            "billing": { "overdue": true, "since": "2024-01-01", "amount": 12.5 },
            "owner": { "name": "Ada" },
            "closed": null
        })
    }

    #[test]
    fn fires_when_equal_and_renders_placeholders() {
        let f = rule("/billing/overdue", Some(Value::Bool(true))).evaluate(&doc()).unwrap().unwrap();
        assert_eq!(f.severity, Severity::Warning);
        assert_eq!(f.header, "Overdue since 2024-01-01");
        assert_eq!(f.body.as_deref(), Some("Owner: Ada ()"));
        assert_eq!(f.actions[0].target, "/accounts/001A");
    }

    #[test]
    fn silent_when_not_equal_missing_or_null() {
        assert!(rule("/billing/overdue", Some(Value::Bool(false))).evaluate(&doc()).unwrap().is_none());
        assert!(rule("/billing/nope", None).evaluate(&doc()).unwrap().is_none());
        assert!(rule("/closed", None).evaluate(&doc()).unwrap().is_none());
    }

    #[test]
    fn presence_only_rule_fires_on_any_value() {
        assert!(rule("/billing/amount", None).evaluate(&doc()).unwrap().is_some());
    }

    #[test]
    fn invalid_pointer_is_an_error() {
        assert!(rule("billing/overdue", None).evaluate(&doc()).is_err());
    }

    #[test]
    fn render_keeps_unterminated_placeholder() {
        assert_eq!(render("a {/id", &doc()), "a {/id");
        assert_eq!(render("{/billing/amount}!", &doc()), "12.5!");
    }
}

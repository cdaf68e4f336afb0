//! Prompt template rendering.
//!
//! Substitutes `{{inputs.K}}`, `{{defaults.K}}`, and `{{steps.K}}`
//! placeholders from the run's resolved inputs, the template's declared
//! defaults, and prior steps' selected outputs. Any placeholder that cannot
//! be resolved is a fatal rendering error for the step.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unresolved placeholders: {0:?}")]
    Unresolved(Vec<String>),
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(inputs|defaults|steps)\.([A-Za-z0-9_-]+)\s*\}\}")
            .unwrap_or_else(|e| panic!("invalid placeholder regex: {}", e))
    })
}

fn leftover_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{[^}]*\}\}").unwrap_or_else(|e| panic!("invalid leftover regex: {}", e))
    })
}

/// Sources a template draws values from.
pub struct RenderContext<'a> {
    pub inputs: &'a BTreeMap<String, serde_json::Value>,
    pub defaults: &'a BTreeMap<String, String>,

    /// Selected output per completed step
    pub steps: &'a BTreeMap<String, String>,
}

impl RenderContext<'_> {
    fn lookup(&self, namespace: &str, key: &str) -> Option<String> {
        match namespace {
            "inputs" => self.inputs.get(key).map(value_to_text),
            "defaults" => self.defaults.get(key).cloned(),
            "steps" => self.steps.get(key).cloned(),
            _ => None,
        }
    }
}

/// Render strings without JSON quoting; everything else via Display.
fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute all placeholders in `template`.
///
/// Collects every unresolved placeholder (including malformed or
/// unknown-namespace ones left behind after substitution) so the error
/// names them all at once.
pub fn render(template: &str, ctx: &RenderContext<'_>) -> Result<String, RenderError> {
    let mut missing = Vec::new();

    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures<'_>| {
        let namespace = &caps[1];
        let key = &caps[2];
        match ctx.lookup(namespace, key) {
            Some(value) => value,
            None => {
                missing.push(format!("{}.{}", namespace, key));
                String::new()
            }
        }
    });

    for leftover in leftover_regex().find_iter(&rendered) {
        missing.push(leftover.as_str().to_string());
    }

    if missing.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(RenderError::Unresolved(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(
        inputs: &'a BTreeMap<String, serde_json::Value>,
        defaults: &'a BTreeMap<String, String>,
        steps: &'a BTreeMap<String, String>,
    ) -> RenderContext<'a> {
        RenderContext {
            inputs,
            defaults,
            steps,
        }
    }

    #[test]
    fn test_substitutes_all_namespaces() {
        let mut inputs = BTreeMap::new();
        inputs.insert("topic".to_string(), json!("AI Ethics"));
        inputs.insert("count".to_string(), json!(3));
        let mut defaults = BTreeMap::new();
        defaults.insert("tone".to_string(), "friendly".to_string());
        let mut steps = BTreeMap::new();
        steps.insert("outline".to_string(), "1. Intro".to_string());

        let rendered = render(
            "Write {{inputs.count}} sections on {{ inputs.topic }} ({{defaults.tone}}): {{steps.outline}}",
            &ctx(&inputs, &defaults, &steps),
        )
        .unwrap();

        assert_eq!(rendered, "Write 3 sections on AI Ethics (friendly): 1. Intro");
    }

    #[test]
    fn test_unresolved_placeholder_is_fatal() {
        let empty_inputs = BTreeMap::new();
        let empty_defaults = BTreeMap::new();
        let empty_steps = BTreeMap::new();

        let err = render(
            "Uses {{steps.missing}} and {{inputs.gone}}",
            &ctx(&empty_inputs, &empty_defaults, &empty_steps),
        )
        .unwrap_err();

        let RenderError::Unresolved(missing) = err;
        assert_eq!(missing, vec!["steps.missing".to_string(), "inputs.gone".to_string()]);
    }

    #[test]
    fn test_unknown_namespace_reported() {
        let empty_inputs = BTreeMap::new();
        let empty_defaults = BTreeMap::new();
        let empty_steps = BTreeMap::new();

        let err = render(
            "Bad: {{secrets.key}}",
            &ctx(&empty_inputs, &empty_defaults, &empty_steps),
        )
        .unwrap_err();
        let RenderError::Unresolved(missing) = err;
        assert_eq!(missing, vec!["{{secrets.key}}".to_string()]);
    }

    #[test]
    fn test_plain_text_passes_through() {
        let empty_inputs = BTreeMap::new();
        let empty_defaults = BTreeMap::new();
        let empty_steps = BTreeMap::new();

        let rendered = render("No placeholders here.", &ctx(&empty_inputs, &empty_defaults, &empty_steps)).unwrap();
        assert_eq!(rendered, "No placeholders here.");
    }
}

//! Pipeline template definitions and loading.
//!
//! Templates are defined in YAML with `metadata`, `inputs`, `steps`, and
//! `defaults` sections. All structural invariants are enforced once at load
//! time: step dependencies must reference declared steps and must form a
//! DAG, choice inputs must declare their options, and step keys are unique.
//! Nothing is re-checked ad hoc during execution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::retry::RetryPolicy;

/// Errors raised while loading or validating a template, or while resolving
/// run inputs against it. None of these are retryable.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse template YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline must declare at least one step")]
    EmptyPipeline,

    #[error("step '{step}' depends on undeclared step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle involving steps: {0:?}")]
    Cycle(Vec<String>),

    #[error("input '{input}': {reason}")]
    InvalidInputSpec { input: String, reason: String },

    #[error("invalid input: {0}")]
    Validation(String),
}

/// Declared kind of a pipeline input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    Text,
    Choice,
    Number,
    Boolean,
}

/// Declaration of one pipeline input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub kind: InputKind,

    #[serde(default)]
    pub required: bool,

    /// Value used when the caller provides none
    pub default: Option<serde_json::Value>,

    /// Allowed values for `choice` inputs
    #[serde(default)]
    pub options: Vec<String>,

    /// Lower bound for `number` inputs
    pub min: Option<f64>,

    /// Upper bound for `number` inputs
    pub max: Option<f64>,
}

impl InputSpec {
    /// Check one provided value against this declaration.
    pub fn check(&self, key: &str, value: &serde_json::Value) -> Result<(), String> {
        match self.kind {
            InputKind::Text => {
                if !value.is_string() {
                    return Err(format!("input '{}' must be text", key));
                }
            }
            InputKind::Choice => {
                let s = value
                    .as_str()
                    .ok_or_else(|| format!("input '{}' must be one of {:?}", key, self.options))?;
                if !self.options.iter().any(|o| o == s) {
                    return Err(format!(
                        "input '{}' must be one of {:?}, got {:?}",
                        key, self.options, s
                    ));
                }
            }
            InputKind::Number => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("input '{}' must be a number", key))?;
                if let Some(min) = self.min {
                    if n < min {
                        return Err(format!("input '{}' must be >= {}", key, min));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return Err(format!("input '{}' must be <= {}", key, max));
                    }
                }
            }
            InputKind::Boolean => {
                if !value.is_boolean() {
                    return Err(format!("input '{}' must be a boolean", key));
                }
            }
        }
        Ok(())
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Render the prompt and call the generation backend
    #[default]
    Generate,

    /// The rendered prompt text is the step's output; no backend call
    Transform,

    /// Render and fail the step if the result is empty
    Validate,

    /// Pause the run until the user supplies the step's output
    UserInput,
}

/// Declaration of one pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step key (unique within the template); filled from the YAML map key
    #[serde(default)]
    pub key: String,

    /// Display name; defaults to the key
    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: StepKind,

    /// Prompt template with `{{inputs.X}}`, `{{steps.Y}}`, `{{defaults.Z}}`
    /// placeholders
    #[serde(rename = "prompt", default)]
    pub prompt_template: String,

    /// Candidate models, most preferred first
    #[serde(rename = "models", default)]
    pub model_preference: Vec<String>,

    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Scheduling hint: steps with this unset run one at a time within
    /// their wave
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    #[serde(default = "RetryPolicy::generation")]
    pub retry: RetryPolicy,

    /// When set, a failure of this step does not fail the run
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateMetadata {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    /// Stable identifier; defaults to the name
    id: Option<String>,
}

fn default_version() -> String {
    "1".to_string()
}

/// Raw file shape; steps are kept as a YAML mapping so declaration order
/// survives into the step list.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    metadata: TemplateMetadata,
    #[serde(default)]
    inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    steps: serde_yaml::Mapping,
    #[serde(default)]
    defaults: BTreeMap<String, String>,
}

/// Immutable pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub inputs: BTreeMap<String, InputSpec>,

    /// Steps in declaration order
    pub steps: Vec<StepSpec>,

    pub defaults: BTreeMap<String, String>,
}

impl PipelineTemplate {
    /// Load and validate a template from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a template from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, TemplateError> {
        let file: TemplateFile = serde_yaml::from_str(content)?;

        let mut steps = Vec::with_capacity(file.steps.len());
        for (key, value) in &file.steps {
            let key: String = serde_yaml::from_value(key.clone())?;
            let mut step: StepSpec = serde_yaml::from_value(value.clone())?;
            step.key = key.clone();
            if step.name.is_empty() {
                step.name = key;
            }
            steps.push(step);
        }

        let template = Self {
            id: file.metadata.id.unwrap_or_else(|| file.metadata.name.clone()),
            name: file.metadata.name,
            version: file.metadata.version,
            description: file.metadata.description,
            inputs: file.inputs,
            steps,
            defaults: file.defaults,
        };

        template.validate()?;
        Ok(template)
    }

    /// Look up a step by key.
    pub fn step(&self, key: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Enforce structural invariants: dependencies reference declared steps
    /// and form a DAG, choice inputs declare options.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.steps.is_empty() {
            return Err(TemplateError::EmptyPipeline);
        }

        let keys: BTreeSet<&str> = self.steps.iter().map(|s| s.key.as_str()).collect();

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.key {
                    return Err(TemplateError::SelfDependency(step.key.clone()));
                }
                if !keys.contains(dep.as_str()) {
                    return Err(TemplateError::UnknownDependency {
                        step: step.key.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        for (key, spec) in &self.inputs {
            if spec.kind == InputKind::Choice && spec.options.is_empty() {
                return Err(TemplateError::InvalidInputSpec {
                    input: key.clone(),
                    reason: "choice input declares no options".to_string(),
                });
            }
        }

        self.execution_order()?;
        Ok(())
    }

    /// Topological order over `depends_on` (Kahn's algorithm), with
    /// alphabetical tie-breaking so the order is deterministic.
    pub fn execution_order(&self) -> Result<Vec<String>, TemplateError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.key.as_str(), s.depends_on.len()))
            .collect();

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&k, _)| k)
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(key) = ready.pop_front() {
            order.push(key.to_string());
            for step in &self.steps {
                if step.depends_on.contains(key) {
                    let degree = in_degree
                        .get_mut(step.key.as_str())
                        .map(|d| {
                            *d -= 1;
                            *d
                        })
                        .unwrap_or(0);
                    if degree == 0 {
                        ready.push_back(&step.key);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck: Vec<String> = self
                .steps
                .iter()
                .filter(|s| !order.contains(&s.key))
                .map(|s| s.key.clone())
                .collect();
            return Err(TemplateError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Resolve caller-provided inputs against the declared specs: apply
    /// defaults, enforce required-ness and per-kind checks, and reject
    /// undeclared keys. Failure here aborts before any step runs.
    pub fn resolve_inputs(
        &self,
        provided: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, TemplateError> {
        for key in provided.keys() {
            if !self.inputs.contains_key(key) {
                return Err(TemplateError::Validation(format!(
                    "unknown input '{}'",
                    key
                )));
            }
        }

        let mut resolved = BTreeMap::new();
        for (key, spec) in &self.inputs {
            let value = provided.get(key).cloned().or_else(|| spec.default.clone());
            match value {
                Some(value) => {
                    spec.check(key, &value).map_err(TemplateError::Validation)?;
                    resolved.insert(key.clone(), value);
                }
                None if spec.required => {
                    return Err(TemplateError::Validation(format!(
                        "required input '{}' is missing",
                        key
                    )));
                }
                None => {}
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BLOG_YAML: &str = r#"
metadata:
  name: blog
  description: Outline then draft
  version: "1.0"

inputs:
  topic:
    type: text
    required: true
  tone:
    type: choice
    options: [formal, friendly]
    default: friendly

steps:
  outline:
    type: generate
    prompt: "Outline a post about {{inputs.topic}} in a {{inputs.tone}} tone."
    models: [alpha-large, alpha-small]

  draft:
    type: generate
    prompt: "Write the post: {{steps.outline}}"
    models: [alpha-large]
    depends_on: [outline]

defaults:
  audience: general
"#;

    #[test]
    fn test_parse_and_order() {
        let template = PipelineTemplate::from_yaml(BLOG_YAML).unwrap();
        assert_eq!(template.id, "blog");
        assert_eq!(template.version, "1.0");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[0].key, "outline");
        assert_eq!(template.defaults["audience"], "general");

        let order = template.execution_order().unwrap();
        assert_eq!(order, vec!["outline".to_string(), "draft".to_string()]);
    }

    #[test]
    fn test_unknown_dependency_rejected_at_load() {
        let yaml = r#"
metadata:
  name: broken
steps:
  draft:
    prompt: "x"
    depends_on: [nonexistent]
"#;
        let err = PipelineTemplate::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected_at_load() {
        let yaml = r#"
metadata:
  name: cyclic
steps:
  a:
    prompt: "x"
    depends_on: [b]
  b:
    prompt: "y"
    depends_on: [a]
"#;
        let err = PipelineTemplate::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TemplateError::Cycle(_)));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let yaml = r#"
metadata:
  name: selfish
steps:
  a:
    prompt: "x"
    depends_on: [a]
"#;
        let err = PipelineTemplate::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TemplateError::SelfDependency(_)));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let yaml = "metadata:\n  name: hollow\n";
        let err = PipelineTemplate::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TemplateError::EmptyPipeline));
    }

    #[test]
    fn test_resolve_inputs() {
        let template = PipelineTemplate::from_yaml(BLOG_YAML).unwrap();

        let mut provided = BTreeMap::new();
        provided.insert("topic".to_string(), json!("AI Ethics"));
        let resolved = template.resolve_inputs(&provided).unwrap();
        assert_eq!(resolved["topic"], json!("AI Ethics"));
        // Declared default applied.
        assert_eq!(resolved["tone"], json!("friendly"));

        // Missing required input.
        let err = template.resolve_inputs(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, TemplateError::Validation(_)));

        // Bad choice value.
        let mut bad = BTreeMap::new();
        bad.insert("topic".to_string(), json!("x"));
        bad.insert("tone".to_string(), json!("sarcastic"));
        assert!(template.resolve_inputs(&bad).is_err());

        // Undeclared key.
        let mut unknown = BTreeMap::new();
        unknown.insert("topic".to_string(), json!("x"));
        unknown.insert("mystery".to_string(), json!("y"));
        assert!(template.resolve_inputs(&unknown).is_err());
    }

    #[test]
    fn test_number_bounds() {
        let spec = InputSpec {
            kind: InputKind::Number,
            min: Some(1.0),
            max: Some(5.0),
            ..Default::default()
        };
        assert!(spec.check("n", &json!(3)).is_ok());
        assert!(spec.check("n", &json!(0)).is_err());
        assert!(spec.check("n", &json!(9.5)).is_err());
        assert!(spec.check("n", &json!("three")).is_err());
    }
}

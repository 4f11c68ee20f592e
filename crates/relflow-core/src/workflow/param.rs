//! Typed parameter declarations and run-start input validation.
//!
//! A definition declares its top-level inputs as [`ParamDef`]s. Registering a
//! declaration with the builder yields a [`Param<T>`] handle that node bodies
//! consume as a typed input. At run start, the supplied JSON values are checked
//! against every declaration before anything is persisted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ParamKind
// ---------------------------------------------------------------------------

/// Semantic type of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// A single-line string.
    String,
    /// A multi-line string (rendered as a text area by UIs).
    LongString,
    StringList,
    Integer,
    Boolean,
    /// Any JSON value.
    Json,
}

impl ParamKind {
    /// Whether `value` has the JSON shape this kind requires.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::String | ParamKind::LongString => value.is_string(),
            ParamKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Json => true,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamKind::String => "string",
            ParamKind::LongString => "long string",
            ParamKind::StringList => "string list",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
            ParamKind::Json => "json",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ParamDef
// ---------------------------------------------------------------------------

type ParamCheck = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Declaration of one top-level workflow input.
#[derive(Clone)]
pub struct ParamDef {
    name: String,
    kind: ParamKind,
    choices: Vec<String>,
    example: Option<String>,
    doc: Option<String>,
    check: Option<ParamCheck>,
}

impl ParamDef {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            choices: Vec::new(),
            example: None,
            doc: None,
            check: None,
        }
    }

    /// Restrict the value to an enumerated set (an HTML select in UIs).
    ///
    /// For `StringList` every element must be one of the choices.
    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Attach a custom validation run after the type and choice checks.
    pub fn check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn allowed_choices(&self) -> &[String] {
        &self.choices
    }

    pub fn example_value(&self) -> Option<&str> {
        self.example.as_deref()
    }

    pub fn documentation(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// Validate one supplied value against this declaration.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        if !self.kind.accepts(value) {
            return Err(ValidationError::TypeMismatch {
                param: self.name.clone(),
                expected: self.kind,
                found: json_type_name(value).to_string(),
            });
        }

        if !self.choices.is_empty() {
            let candidates: Vec<String> = match value {
                Value::Array(items) if self.kind == ParamKind::StringList => {
                    items.iter().map(render_choice).collect()
                }
                other => vec![render_choice(other)],
            };
            if let Some(bad) = candidates.into_iter().find(|c| !self.choices.contains(c)) {
                return Err(ValidationError::NotAllowed {
                    param: self.name.clone(),
                    value: bad,
                    choices: self.choices.clone(),
                });
            }
        }

        if let Some(check) = &self.check {
            check(value).map_err(|reason| ValidationError::CheckFailed {
                param: self.name.clone(),
                reason,
            })?;
        }

        Ok(())
    }
}

impl fmt::Debug for ParamDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("choices", &self.choices)
            .field("example", &self.example)
            .field("doc", &self.doc)
            .field("check", &self.check.is_some())
            .finish()
    }
}

fn render_choice(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Param<T>
// ---------------------------------------------------------------------------

/// Typed handle to a registered parameter, usable as a node input.
pub struct Param<T> {
    pub(crate) builder: Uuid,
    pub(crate) name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Param<T> {
    pub(crate) fn new(builder: Uuid, name: String) -> Self {
        Self {
            builder,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Param<T> {
    fn clone(&self) -> Self {
        Self::new(self.builder, self.name.clone())
    }
}

impl<T> fmt::Debug for Param<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Param").field(&self.name).finish()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Errors reported synchronously by `Engine::start`; no run is created.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing value for parameter '{0}'")]
    Missing(String),

    #[error("unknown parameter '{0}'")]
    Unknown(String),

    #[error("parameter '{param}' expects {expected}, got {found}")]
    TypeMismatch {
        param: String,
        expected: ParamKind,
        found: String,
    },

    #[error("parameter '{param}' does not allow '{value}' (choices: {})", choices.join(", "))]
    NotAllowed {
        param: String,
        value: String,
        choices: Vec<String>,
    },

    #[error("parameter '{param}' is invalid: {reason}")]
    CheckFailed { param: String, reason: String },
}

/// Check `inputs` against `params`.
///
/// Every declared parameter must be supplied and no undeclared name is
/// accepted. Declared parameters are checked in declaration order, so the
/// first reported error is deterministic.
pub fn validate_inputs(
    params: &[ParamDef],
    mut inputs: HashMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ValidationError> {
    let mut validated = BTreeMap::new();
    for param in params {
        let value = inputs
            .remove(param.name())
            .ok_or_else(|| ValidationError::Missing(param.name().to_string()))?;
        param.validate(&value)?;
        validated.insert(param.name().to_string(), value);
    }

    if let Some(unknown) = inputs.into_keys().min() {
        return Err(ValidationError::Unknown(unknown));
    }

    Ok(validated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn kind_accepts_matching_shapes() {
        assert!(ParamKind::String.accepts(&json!("x")));
        assert!(!ParamKind::String.accepts(&json!(1)));
        assert!(ParamKind::StringList.accepts(&json!(["a", "b"])));
        assert!(!ParamKind::StringList.accepts(&json!(["a", 2])));
        assert!(ParamKind::Integer.accepts(&json!(-4)));
        assert!(!ParamKind::Integer.accepts(&json!(1.5)));
        assert!(ParamKind::Boolean.accepts(&json!(true)));
        assert!(ParamKind::Json.accepts(&json!({"k": [1, 2]})));
    }

    #[test]
    fn choices_constrain_value() {
        let def = ParamDef::new("bump", ParamKind::String).choices(["minor", "patch"]);
        assert!(def.validate(&json!("minor")).is_ok());

        let err = def.validate(&json!("major")).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NotAllowed {
                param: "bump".to_string(),
                value: "major".to_string(),
                choices: vec!["minor".to_string(), "patch".to_string()],
            }
        );
        assert!(err.to_string().contains("minor, patch"));
    }

    #[test]
    fn choices_apply_to_each_list_element() {
        let def = ParamDef::new("targets", ParamKind::StringList).choices(["linux", "darwin"]);
        assert!(def.validate(&json!(["linux", "darwin"])).is_ok());
        assert!(matches!(
            def.validate(&json!(["linux", "plan9"])),
            Err(ValidationError::NotAllowed { value, .. }) if value == "plan9"
        ));
    }

    #[test]
    fn custom_check_runs_after_type_check() {
        let def = ParamDef::new("reviewers", ParamKind::StringList).check(|v| {
            if v.as_array().is_some_and(|a| a.is_empty()) {
                Err("at least one reviewer is required".to_string())
            } else {
                Ok(())
            }
        });
        assert!(matches!(
            def.validate(&json!([])),
            Err(ValidationError::CheckFailed { .. })
        ));
        assert!(matches!(
            def.validate(&json!("alice")),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn validate_inputs_reports_missing_then_unknown() {
        let params = vec![
            ParamDef::new("bump", ParamKind::String),
            ParamDef::new("dry_run", ParamKind::Boolean),
        ];

        let err = validate_inputs(&params, inputs(&[("bump", json!("minor"))])).unwrap_err();
        assert_eq!(err, ValidationError::Missing("dry_run".to_string()));

        let err = validate_inputs(
            &params,
            inputs(&[
                ("bump", json!("minor")),
                ("dry_run", json!(false)),
                ("extra", json!(1)),
            ]),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Unknown("extra".to_string()));
    }

    #[test]
    fn validate_inputs_returns_ordered_map() {
        let params = vec![
            ParamDef::new("b", ParamKind::Integer),
            ParamDef::new("a", ParamKind::String).example("v0.1.0"),
        ];
        let validated =
            validate_inputs(&params, inputs(&[("a", json!("x")), ("b", json!(2))])).unwrap();
        let keys: Vec<_> = validated.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(params[1].example_value(), Some("v0.1.0"));
    }
}

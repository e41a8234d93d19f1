//! Runtime values flowing along graph connections.
//!
//! Every value carried between ports is a [`DataValue`]: a tagged union of a
//! wire type name and a payload. Scalar kinds have matching `T[]` array kinds
//! used by split execution and loop break outputs. One reserved kind, the
//! control-flow exclusion sentinel, is not data at all — it signals "this
//! branch intentionally did not execute" and is routed around (or consumed)
//! by the scheduler rather than by node logic.

use serde::{Deserialize, Serialize};

/// Wire port id under which the scheduler records a node-wide exclusion.
///
/// When a node is skipped by control flow, its result map contains a single
/// entry under this port so dependents can observe the exclusion without the
/// node ever having declared such an output.
pub const CONTROL_FLOW_EXCLUDED_PORT: &str = "__control-flow-excluded__";

/// Sub-reason attached to an exclusion sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    /// A loop controller is still iterating; its `break` output is excluded
    /// only until the loop finishes. Nodes waiting on the loop's result treat
    /// this as "not yet" rather than "never".
    LoopNotBroken,
}

/// A typed value traveling along a connection.
///
/// Serializes as `{ "type": <wire name>, "value": <payload> }`; array kinds
/// use the `T[]` wire names (`"string[]"`, `"number[]"`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum DataValue {
    /// UTF-8 text.
    #[serde(rename = "string")]
    String(String),
    /// Double-precision float (integers included).
    #[serde(rename = "number")]
    Number(f64),
    /// True/false.
    #[serde(rename = "boolean")]
    Boolean(bool),
    /// Structured JSON data.
    #[serde(rename = "object")]
    Object(serde_json::Value),
    /// Untyped payload; consumers infer what they need.
    #[serde(rename = "any")]
    Any(serde_json::Value),
    /// The control-flow exclusion sentinel. Not data: marks a branch that
    /// did not execute, optionally with a [`ExclusionReason`].
    #[serde(rename = "control-flow-excluded")]
    ControlFlowExcluded(Option<ExclusionReason>),
    /// Array of strings.
    #[serde(rename = "string[]")]
    StringArray(Vec<String>),
    /// Array of numbers.
    #[serde(rename = "number[]")]
    NumberArray(Vec<f64>),
    /// Array of booleans.
    #[serde(rename = "boolean[]")]
    BooleanArray(Vec<bool>),
    /// Array of JSON objects.
    #[serde(rename = "object[]")]
    ObjectArray(Vec<serde_json::Value>),
    /// Heterogeneous array; elements keep their own tags.
    #[serde(rename = "any[]")]
    AnyArray(Vec<DataValue>),
}

impl DataValue {
    /// The exclusion sentinel with no sub-reason.
    #[must_use]
    pub fn excluded() -> Self {
        Self::ControlFlowExcluded(None)
    }

    /// The exclusion sentinel for a loop that has not broken yet.
    #[must_use]
    pub fn loop_not_broken() -> Self {
        Self::ControlFlowExcluded(Some(ExclusionReason::LoopNotBroken))
    }

    /// Wire name of this value's type (`"string"`, `"number[]"`, ...).
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::Object(_) => "object",
            Self::Any(_) => "any",
            Self::ControlFlowExcluded(_) => "control-flow-excluded",
            Self::StringArray(_) => "string[]",
            Self::NumberArray(_) => "number[]",
            Self::BooleanArray(_) => "boolean[]",
            Self::ObjectArray(_) => "object[]",
            Self::AnyArray(_) => "any[]",
        }
    }

    /// Is this the exclusion sentinel (any sub-reason)?
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        matches!(self, Self::ControlFlowExcluded(_))
    }

    /// Is this the "loop not yet broken" sentinel specifically?
    #[must_use]
    pub fn is_loop_not_broken(&self) -> bool {
        matches!(
            self,
            Self::ControlFlowExcluded(Some(ExclusionReason::LoopNotBroken))
        )
    }

    /// Is this one of the `T[]` array kinds?
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::StringArray(_)
                | Self::NumberArray(_)
                | Self::BooleanArray(_)
                | Self::ObjectArray(_)
                | Self::AnyArray(_)
        )
    }

    /// Element count for array kinds, `None` for scalars.
    #[must_use]
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Self::StringArray(v) => Some(v.len()),
            Self::NumberArray(v) => Some(v.len()),
            Self::BooleanArray(v) => Some(v.len()),
            Self::ObjectArray(v) => Some(v.len()),
            Self::AnyArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Coerce to a boolean.
    ///
    /// Empty strings, the literal string `"false"`, zero, `false`, and the
    /// exclusion sentinel are false. Arrays are true when every element
    /// coerces to true (vacuously true when empty). Objects follow JSON
    /// truthiness (`null` is false).
    #[must_use]
    pub fn coerce_bool(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty() && s != "false",
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Boolean(b) => *b,
            Self::Object(v) | Self::Any(v) => json_truthy(v),
            Self::ControlFlowExcluded(_) => false,
            Self::StringArray(v) => v.iter().all(|s| !s.is_empty() && s != "false"),
            Self::NumberArray(v) => v.iter().all(|n| *n != 0.0 && !n.is_nan()),
            Self::BooleanArray(v) => v.iter().all(|b| *b),
            Self::ObjectArray(v) => v.iter().all(json_truthy),
            Self::AnyArray(v) => v.iter().all(Self::coerce_bool),
        }
    }

    /// Coerce to a number, if the value has a numeric reading.
    #[must_use]
    pub fn coerce_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.trim().parse().ok(),
            Self::Object(v) | Self::Any(v) => v.as_f64(),
            _ => None,
        }
    }

    /// Coerce to a display string. Strings pass through verbatim; everything
    /// else renders as JSON (numbers without a trailing `.0` when integral).
    #[must_use]
    pub fn coerce_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Boolean(b) => b.to_string(),
            Self::Object(v) | Self::Any(v) => {
                if let serde_json::Value::String(s) = v {
                    s.clone()
                } else {
                    v.to_string()
                }
            }
            Self::ControlFlowExcluded(_) => String::new(),
            Self::StringArray(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::NumberArray(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::BooleanArray(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::ObjectArray(v) => serde_json::to_string(v).unwrap_or_default(),
            Self::AnyArray(v) => {
                let parts: Vec<String> = v.iter().map(Self::coerce_string).collect();
                serde_json::to_string(&parts).unwrap_or_default()
            }
        }
    }

    /// Coerce to a list of strings (used by nodes that accept either one
    /// string or a string array).
    #[must_use]
    pub fn coerce_string_array(&self) -> Vec<String> {
        match self {
            Self::StringArray(v) => v.clone(),
            Self::AnyArray(v) => v.iter().map(Self::coerce_string).collect(),
            other if other.is_excluded() => Vec::new(),
            other => vec![other.coerce_string()],
        }
    }

    /// Split an array value into its scalar elements; scalars yield a
    /// one-element vec of themselves.
    #[must_use]
    pub fn arrayize(&self) -> Vec<DataValue> {
        match self {
            Self::StringArray(v) => v.iter().cloned().map(Self::String).collect(),
            Self::NumberArray(v) => v.iter().copied().map(Self::Number).collect(),
            Self::BooleanArray(v) => v.iter().copied().map(Self::Boolean).collect(),
            Self::ObjectArray(v) => v.iter().cloned().map(Self::Object).collect(),
            Self::AnyArray(v) => v.clone(),
            scalar => vec![scalar.clone()],
        }
    }

    /// Interpret a raw JSON value as the closest matching kind.
    #[must_use]
    pub fn infer(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Array(items) => {
                Self::AnyArray(items.into_iter().map(Self::infer).collect())
            }
            serde_json::Value::Object(_) => Self::Object(value),
            serde_json::Value::Null => Self::Any(serde_json::Value::Null),
        }
    }

    /// Build a value of the given wire type from raw JSON, falling back to
    /// inference when the payload does not fit the declared type.
    #[must_use]
    pub fn from_typed_json(data_type: &str, value: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match (data_type, value) {
            ("string", J::String(s)) => Self::String(s),
            ("number", J::Number(n)) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            ("boolean", J::Bool(b)) => Self::Boolean(b),
            ("object", v @ J::Object(_)) => Self::Object(v),
            ("any", v) => Self::Any(v),
            ("string[]", J::Array(items)) => Self::StringArray(
                items
                    .into_iter()
                    .map(|v| match v {
                        J::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            ("number[]", J::Array(items)) => Self::NumberArray(
                items
                    .into_iter()
                    .map(|v| v.as_f64().unwrap_or(f64::NAN))
                    .collect(),
            ),
            ("boolean[]", J::Array(items)) => {
                Self::BooleanArray(items.into_iter().map(|v| json_truthy(&v)).collect())
            }
            ("object[]", J::Array(items)) => Self::ObjectArray(items),
            ("any[]", J::Array(items)) => {
                Self::AnyArray(items.into_iter().map(Self::infer).collect())
            }
            (_, v) => Self::infer(v),
        }
    }

    /// The zero value of a wire type, used where an unset variable must still
    /// produce something typed.
    #[must_use]
    pub fn default_for_type(data_type: &str) -> Self {
        match data_type {
            "string" => Self::String(String::new()),
            "number" => Self::Number(0.0),
            "boolean" => Self::Boolean(false),
            "object" => Self::Object(serde_json::json!({})),
            "string[]" => Self::StringArray(Vec::new()),
            "number[]" => Self::NumberArray(Vec::new()),
            "boolean[]" => Self::BooleanArray(Vec::new()),
            "object[]" => Self::ObjectArray(Vec::new()),
            "any[]" => Self::AnyArray(Vec::new()),
            _ => Self::Any(serde_json::Value::Null),
        }
    }

    /// Aggregate one output port's per-branch values from a split execution
    /// into a single array value, ordered by branch index.
    ///
    /// When every produced value shares one scalar kind the result is the
    /// matching `T[]`; otherwise (mixed kinds, missing branches, nested
    /// arrays) the result is `any[]` with absent branches as `any` nulls.
    #[must_use]
    pub fn aggregate_split(branches: &[Option<DataValue>]) -> Self {
        fn uniform<'a, T, F>(branches: &'a [Option<DataValue>], pick: F) -> Option<Vec<T>>
        where
            F: Fn(&'a DataValue) -> Option<T>,
        {
            branches
                .iter()
                .map(|b| b.as_ref().and_then(&pick))
                .collect()
        }

        if let Some(v) = uniform(branches, |b| match b {
            DataValue::String(s) => Some(s.clone()),
            _ => None,
        }) {
            return Self::StringArray(v);
        }
        if let Some(v) = uniform(branches, |b| match b {
            DataValue::Number(n) => Some(*n),
            _ => None,
        }) {
            return Self::NumberArray(v);
        }
        if let Some(v) = uniform(branches, |b| match b {
            DataValue::Boolean(x) => Some(*x),
            _ => None,
        }) {
            return Self::BooleanArray(v);
        }
        if let Some(v) = uniform(branches, |b| match b {
            DataValue::Object(o) => Some(o.clone()),
            _ => None,
        }) {
            return Self::ObjectArray(v);
        }

        Self::AnyArray(
            branches
                .iter()
                .map(|b| {
                    b.clone()
                        .unwrap_or(Self::Any(serde_json::Value::Null))
                })
                .collect(),
        )
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// JSON truthiness: `null` and `false` and `0` and `""` are false,
/// everything else (arrays and objects included) is true.
fn json_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// Render an f64 without a trailing `.0` when it is integral.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

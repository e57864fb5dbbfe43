//! Response transformations, applied in registration order. Only top-level
//! JSON objects are mutated; primitives and arrays pass through untouched.

use std::sync::Arc;

/// One transformation step.
#[derive(Clone)]
pub enum ResponseTransform {
    /// Drop the named top-level keys.
    RemoveFields(Vec<String>),
    /// Insert (or overwrite) top-level keys.
    AddFields(Vec<(String, serde_json::Value)>),
    /// Arbitrary value-to-value function.
    Custom(Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>),
}

impl ResponseTransform {
    pub fn remove_fields<I: IntoIterator<Item = S>, S: Into<String>>(fields: I) -> Self {
        ResponseTransform::RemoveFields(fields.into_iter().map(Into::into).collect())
    }

    pub fn add_field(name: impl Into<String>, value: serde_json::Value) -> Self {
        ResponseTransform::AddFields(vec![(name.into(), value)])
    }

    pub fn custom(
        f: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        ResponseTransform::Custom(Arc::new(f))
    }

    pub fn apply(&self, value: serde_json::Value) -> serde_json::Value {
        match self {
            ResponseTransform::RemoveFields(fields) => match value {
                serde_json::Value::Object(mut object) => {
                    for field in fields {
                        object.remove(field);
                    }
                    serde_json::Value::Object(object)
                }
                other => other,
            },
            ResponseTransform::AddFields(fields) => match value {
                serde_json::Value::Object(mut object) => {
                    for (name, field_value) in fields {
                        object.insert(name.clone(), field_value.clone());
                    }
                    serde_json::Value::Object(object)
                }
                other => other,
            },
            ResponseTransform::Custom(f) => f(value),
        }
    }
}

/// Run every transformation in order.
pub fn apply_all(transforms: &[ResponseTransform], value: serde_json::Value) -> serde_json::Value {
    transforms
        .iter()
        .fold(value, |value, transform| transform.apply(value))
}

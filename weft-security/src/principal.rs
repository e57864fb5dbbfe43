use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use weft_core::message::Context;

/// Context attribute key under which the principal is stored.
pub const PRINCIPAL_ATTR: &str = "principal";

/// The authenticated identity for a request.
///
/// Permissions are `resource:action:scope` strings; `*` matches any value
/// in a segment, so `orders:*:*` grants every action on orders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Principal {
    pub id: String,
    pub roles: HashSet<String>,
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: HashSet::new(),
            permissions: HashSet::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions
            .iter()
            .any(|held| permission_matches(held, required))
    }

    /// Store the principal (and the conventional `user` / `user_id`
    /// attributes) on the request context.
    pub fn store(&self, ctx: &mut Context) {
        if let Ok(value) = serde_json::to_value(self) {
            ctx.set_attr(PRINCIPAL_ATTR, value);
        }
        ctx.set_attr("user", serde_json::json!(self.id));
        ctx.set_attr("user_id", serde_json::json!(self.id));
    }

    /// Read the principal back from the context, if authentication ran.
    pub fn from_context(ctx: &Context) -> Option<Self> {
        ctx.attr(PRINCIPAL_ATTR)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// `held` may use `*` per segment; `required` is always concrete.
fn permission_matches(held: &str, required: &str) -> bool {
    let held: Vec<&str> = held.split(':').collect();
    let required: Vec<&str> = required.split(':').collect();
    if held.len() != required.len() {
        return false;
    }
    held.iter()
        .zip(required.iter())
        .all(|(h, r)| *h == "*" || h == r)
}

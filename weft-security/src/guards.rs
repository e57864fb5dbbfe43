//! Authorization guards: requirement variants compiled into middleware
//! chain entries at fixed priorities, so they always run nearest the
//! handler (method guards innermost) and `allow_anonymous` can suppress
//! them wholesale.

use std::sync::Arc;

use weft_core::error::Error;
use weft_core::message::Context;
use weft_core::middleware::{
    Entry, METHOD_GUARD_PRIORITY, SERVICE_GUARD_PRIORITY,
};

use crate::principal::Principal;

/// Where a guard is attached; decides its chain priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardLevel {
    Service,
    Method,
}

impl GuardLevel {
    fn priority(self) -> i32 {
        match self {
            GuardLevel::Service => SERVICE_GUARD_PRIORITY,
            GuardLevel::Method => METHOD_GUARD_PRIORITY,
        }
    }
}

/// A named predicate over the principal and request context.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    fn allows(&self, principal: &Principal, ctx: &Context) -> bool;
}

/// Declarative authorization requirement, resolved to a concrete guard
/// entry at chain-build time.
#[derive(Clone)]
pub enum AuthRequirement {
    /// Principal must hold one (or, with `require_all`, every one) of the
    /// listed roles.
    Role {
        roles: Vec<String>,
        require_all: bool,
    },
    /// Principal must hold one (or all) of the listed permissions.
    Permission {
        permissions: Vec<String>,
        require_all: bool,
    },
    /// An arbitrary named policy.
    Policy(Arc<dyn Policy>),
}

impl AuthRequirement {
    pub fn any_role<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Self {
        AuthRequirement::Role {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: false,
        }
    }

    pub fn all_roles<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Self {
        AuthRequirement::Role {
            roles: roles.into_iter().map(Into::into).collect(),
            require_all: true,
        }
    }

    pub fn any_permission<I: IntoIterator<Item = S>, S: Into<String>>(permissions: I) -> Self {
        AuthRequirement::Permission {
            permissions: permissions.into_iter().map(Into::into).collect(),
            require_all: false,
        }
    }

    pub fn policy(policy: Arc<dyn Policy>) -> Self {
        AuthRequirement::Policy(policy)
    }

    fn entry_name(&self) -> String {
        match self {
            AuthRequirement::Role { .. } => "guard:role".to_string(),
            AuthRequirement::Permission { .. } => "guard:permission".to_string(),
            AuthRequirement::Policy(policy) => format!("guard:policy:{}", policy.name()),
        }
    }

    fn check(&self, principal: &Principal, ctx: &Context) -> Result<(), Error> {
        let allowed = match self {
            AuthRequirement::Role { roles, require_all } => {
                if *require_all {
                    roles.iter().all(|r| principal.has_role(r))
                } else {
                    roles.iter().any(|r| principal.has_role(r))
                }
            }
            AuthRequirement::Permission {
                permissions,
                require_all,
            } => {
                if *require_all {
                    permissions.iter().all(|p| principal.has_permission(p))
                } else {
                    permissions.iter().any(|p| principal.has_permission(p))
                }
            }
            AuthRequirement::Policy(policy) => policy.allows(principal, ctx),
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden(match self {
                AuthRequirement::Role { .. } => "insufficient roles".into(),
                AuthRequirement::Permission { .. } => "insufficient permissions".into(),
                AuthRequirement::Policy(policy) => {
                    format!("policy {} denied the request", policy.name())
                }
            }))
        }
    }

    /// Compile into a chain entry at the deterministic guard priority.
    pub fn into_entry(self, level: GuardLevel) -> Entry {
        let name = self.entry_name();
        let requirement = self;
        Entry::new(name, level.priority(), move |mut ctx, next| {
            let requirement = requirement.clone();
            Box::pin(async move {
                let Some(principal) = Principal::from_context(&ctx) else {
                    ctx.fail(Error::Unauthorized("authentication required".into()));
                    return ctx;
                };
                if let Err(err) = requirement.check(&principal, &ctx) {
                    ctx.fail(err);
                    return ctx;
                }
                next.run(ctx).await
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use weft_core::message::{Headers, Request};
    use weft_core::middleware::{Chain, Terminal};

    fn ctx_with(principal: Option<Principal>) -> Context {
        let mut ctx = Context::new(Request {
            service: "svc".into(),
            endpoint: "/e".into(),
            content_type: "application/json".into(),
            headers: Headers::new(),
            body: Bytes::new(),
        });
        if let Some(principal) = principal {
            principal.store(&mut ctx);
        }
        ctx
    }

    fn reached_terminal() -> Terminal {
        Arc::new(|mut ctx| {
            Box::pin(async move {
                ctx.set_attr("reached", serde_json::json!(true));
                ctx
            })
        })
    }

    async fn run(requirement: AuthRequirement, ctx: Context) -> Context {
        let mut chain = Chain::new();
        chain.use_entry(requirement.into_entry(GuardLevel::Service));
        let prepared = chain.prepare().unwrap();
        prepared.execute(ctx, reached_terminal()).await
    }

    #[tokio::test]
    async fn missing_principal_is_401() {
        let requirement = AuthRequirement::any_role(["admin"]);
        let ctx = run(requirement, ctx_with(None)).await;
        assert_eq!(ctx.error().map(|e| e.status_code()), Some(401));
        assert!(ctx.attr("reached").is_none());
    }

    #[tokio::test]
    async fn role_check_any() {
        let requirement = AuthRequirement::any_role(["admin", "operator"]);
        let principal = Principal::new("u").with_role("operator");
        let ctx = run(requirement.clone(), ctx_with(Some(principal))).await;
        assert!(ctx.error().is_none());
        assert!(ctx.attr("reached").is_some());

        let outsider = Principal::new("u").with_role("guest");
        let ctx = run(requirement, ctx_with(Some(outsider))).await;
        assert_eq!(ctx.error().map(|e| e.status_code()), Some(403));
    }

    #[tokio::test]
    async fn role_check_all() {
        let requirement = AuthRequirement::all_roles(["admin", "auditor"]);
        let partial = Principal::new("u").with_role("admin");
        let ctx = run(requirement.clone(), ctx_with(Some(partial))).await;
        assert_eq!(ctx.error().map(|e| e.status_code()), Some(403));

        let full = Principal::new("u").with_role("admin").with_role("auditor");
        let ctx = run(requirement, ctx_with(Some(full))).await;
        assert!(ctx.error().is_none());
    }

    #[tokio::test]
    async fn permission_check() {
        let requirement = AuthRequirement::any_permission(["orders:read:own"]);
        let principal = Principal::new("u").with_permission("orders:*:*");
        let ctx = run(requirement.clone(), ctx_with(Some(principal))).await;
        assert!(ctx.error().is_none());

        let denied = Principal::new("u").with_permission("invoices:read:own");
        let ctx = run(requirement, ctx_with(Some(denied))).await;
        assert_eq!(ctx.error().map(|e| e.status_code()), Some(403));
    }

    #[tokio::test]
    async fn policy_check() {
        struct SelfOnly;
        impl Policy for SelfOnly {
            fn name(&self) -> &str {
                "self-only"
            }
            fn allows(&self, principal: &Principal, _ctx: &Context) -> bool {
                principal.id == "u-1"
            }
        }

        let requirement = AuthRequirement::policy(Arc::new(SelfOnly));
        let ctx = run(requirement.clone(), ctx_with(Some(Principal::new("u-1")))).await;
        assert!(ctx.error().is_none());

        let ctx = run(requirement, ctx_with(Some(Principal::new("u-2")))).await;
        let err = ctx.error().unwrap();
        assert_eq!(err.status_code(), 403);
        assert!(err.message().contains("self-only"));
    }

    #[tokio::test]
    async fn method_guard_priority_is_innermost() {
        let service_guard =
            AuthRequirement::any_role(["a"]).into_entry(GuardLevel::Service);
        let method_guard = AuthRequirement::any_role(["a"]).into_entry(GuardLevel::Method);
        assert!(service_guard.priority > method_guard.priority);
        assert!(service_guard.is_guard());
        assert!(method_guard.is_guard());
    }
}

use crate::middleware::{Entry, PRIORITY_CORS};

/// CORS policy. Origins may include `"*"`; the wildcard is never combined
/// with credentials — when `allow_credentials` is set the concrete origin
/// is echoed instead.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            allow_credentials: false,
            max_age_secs: 86_400,
        }
    }
}

impl CorsConfig {
    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin))
    }

    fn allow_origin_value(&self, origin: &str) -> String {
        let wildcard = self.allowed_origins.iter().any(|o| o == "*");
        if wildcard && !self.allow_credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }
}

/// Handles preflight OPTIONS requests and stamps simple responses. The HTTP
/// verb is read from the `X-Http-Method` header placed by HTTP-fronting
/// layers; plain RPC requests without an Origin pass through untouched.
pub fn cors(config: CorsConfig) -> Entry {
    Entry::new("cors", PRIORITY_CORS, move |mut ctx, next| {
        let config = config.clone();
        Box::pin(async move {
            let origin = match ctx.request().headers.get("Origin") {
                Some(origin) => origin.to_string(),
                None => return next.run(ctx).await,
            };
            if !config.origin_allowed(&origin) {
                return next.run(ctx).await;
            }
            let allow_origin = config.allow_origin_value(&origin);

            let is_preflight = ctx
                .request()
                .headers
                .get("X-Http-Method")
                .map(|m| m.eq_ignore_ascii_case("OPTIONS"))
                .unwrap_or(false);

            if is_preflight {
                let response = ctx.response_mut();
                response.status = 204;
                response
                    .headers
                    .set("Access-Control-Allow-Origin", allow_origin);
                response.headers.set(
                    "Access-Control-Allow-Methods",
                    config.allowed_methods.join(", "),
                );
                response.headers.set(
                    "Access-Control-Allow-Headers",
                    config.allowed_headers.join(", "),
                );
                response
                    .headers
                    .set("Access-Control-Max-Age", config.max_age_secs.to_string());
                if config.allow_credentials {
                    response
                        .headers
                        .set("Access-Control-Allow-Credentials", "true");
                }
                return ctx;
            }

            let mut ctx = next.run(ctx).await;
            let response = ctx.response_mut();
            response
                .headers
                .set("Access-Control-Allow-Origin", allow_origin);
            response.headers.append("Vary", "Origin");
            if config.allow_credentials {
                response
                    .headers
                    .set("Access-Control-Allow-Credentials", "true");
            }
            ctx
        })
    })
}

//! Route lookup: exact paths in a map, `:param` patterns compiled to
//! segment matchers scanned in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::route::Route;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

struct CompiledRoute {
    method: String,
    segments: Vec<Segment>,
    route: Arc<Route>,
}

fn compile(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

fn method_matches(route_method: &str, request_method: &str) -> bool {
    route_method == "ANY" || route_method.eq_ignore_ascii_case(request_method)
}

/// The gateway's route table.
#[derive(Default)]
pub struct RouteTable {
    exact: HashMap<(String, String), Arc<Route>>,
    patterns: Vec<CompiledRoute>,
    all: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) {
        let route = Arc::new(route);
        self.all.push(route.clone());
        if route.path.contains(':') {
            self.patterns.push(CompiledRoute {
                method: route.http_method.clone(),
                segments: compile(&route.path),
                route,
            });
        } else {
            self.exact
                .insert((route.http_method.clone(), route.path.clone()), route);
        }
    }

    /// Find the route for a request. Returns the matched route and the
    /// extracted path parameters in pattern order.
    pub fn find(&self, method: &str, path: &str) -> Option<(Arc<Route>, Vec<(String, String)>)> {
        let method = method.to_ascii_uppercase();
        if let Some(route) = self
            .exact
            .get(&(method.clone(), path.to_string()))
            .or_else(|| self.exact.get(&("ANY".to_string(), path.to_string())))
        {
            return Some((route.clone(), Vec::new()));
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for candidate in &self.patterns {
            if !method_matches(&candidate.method, &method) {
                continue;
            }
            if candidate.segments.len() != parts.len() {
                continue;
            }
            let mut params = Vec::new();
            let matched = candidate
                .segments
                .iter()
                .zip(parts.iter())
                .all(|(segment, part)| match segment {
                    Segment::Literal(literal) => literal == part,
                    Segment::Param(name) => {
                        params.push((name.clone(), part.to_string()));
                        true
                    }
                });
            if matched {
                return Some((candidate.route.clone(), params));
            }
        }
        None
    }

    /// Whether any route matches the method and path.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.find(method, path).is_some()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.all
    }
}

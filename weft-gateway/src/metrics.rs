//! Gateway metrics in Prometheus text exposition format.

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

pub struct GatewayMetrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub response_time_seconds: Gauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let requests_total =
            IntCounter::new("gateway_requests_total", "Total requests handled by the gateway")
                .expect("metric definition");
        let cache_hits_total =
            IntCounter::new("gateway_cache_hits_total", "Gateway response cache hits")
                .expect("metric definition");
        let cache_misses_total =
            IntCounter::new("gateway_cache_misses_total", "Gateway response cache misses")
                .expect("metric definition");
        let response_time_seconds = Gauge::new(
            "gateway_response_time_seconds",
            "Duration of the most recent gateway request",
        )
        .expect("metric definition");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(cache_hits_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(cache_misses_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(response_time_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            requests_total,
            cache_hits_total,
            cache_misses_total,
            response_time_seconds,
        }
    }

    /// Render the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = GatewayMetrics::new();
        metrics.requests_total.inc();
        metrics.cache_hits_total.inc();
        metrics.cache_misses_total.inc();
        metrics.response_time_seconds.set(0.012);

        let text = metrics.encode();
        assert!(text.contains("gateway_requests_total 1"));
        assert!(text.contains("gateway_cache_hits_total 1"));
        assert!(text.contains("gateway_cache_misses_total 1"));
        assert!(text.contains("gateway_response_time_seconds"));
    }
}

//! Environment-driven configuration.
//!
//! | Variable | Effect |
//! |---|---|
//! | `WEFT_BIND_ADDR` | server bind address |
//! | `WEFT_ADVERTISE_ADDR` | address registered in the registry |
//! | `WEFT_REGISTRY` | registry driver (`memory` is the only built-in) |
//! | `WEFT_LOG` / `RUST_LOG` | tracing filter |

use std::env;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registry::{MemoryRegistry, Registry};
use crate::service::ServiceOptions;

/// Overlay environment variables onto programmatic options. Explicit env
/// values win, matching how deployments override code defaults.
pub fn apply_env(options: &mut ServiceOptions) {
    if let Ok(addr) = env::var("WEFT_BIND_ADDR") {
        if !addr.is_empty() {
            options.bind_addr = addr;
        }
    }
    if let Ok(addr) = env::var("WEFT_ADVERTISE_ADDR") {
        if !addr.is_empty() {
            options.advertise_addr = Some(addr);
        }
    }
}

/// Resolve the registry driver named by `WEFT_REGISTRY`. Unset means "let
/// the service use its configured or default registry".
pub fn registry_from_env() -> Result<Option<Arc<dyn Registry>>> {
    match env::var("WEFT_REGISTRY") {
        Ok(driver) if driver.is_empty() || driver == "memory" => {
            Ok(Some(Arc::new(MemoryRegistry::new())))
        }
        Ok(driver) => Err(Error::Config(format!("unknown registry driver: {driver}"))),
        Err(_) => Ok(None),
    }
}

/// The tracing filter: `WEFT_LOG`, then `RUST_LOG`, then `info`.
pub fn log_filter() -> String {
    env::var("WEFT_LOG")
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string())
}

//! weft-security — authentication and authorization for weft services.
//!
//! Three layers:
//! - [`Principal`]: the authenticated identity (roles, permissions,
//!   attributes), stored in the request context under a well-known key.
//! - Authenticators: middleware that turn credentials (Bearer, Basic,
//!   API key, JWT) into a principal, or fail the request with 401.
//! - Guards: [`AuthRequirement`] variants compiled into chain entries at
//!   fixed priorities; 401 without a principal, 403 on a failed check.

mod authenticators;
mod guards;
mod principal;

pub use authenticators::{
    api_key_auth, api_key_auth_with_header, basic_auth, bearer_auth, jwt_auth,
    CredentialsVerifier, JwtConfig, JwtValidator, TokenValidator,
};
pub use guards::{AuthRequirement, GuardLevel, Policy};
pub use principal::{Principal, PRINCIPAL_ATTR};

pub mod prelude {
    pub use crate::{
        bearer_auth, jwt_auth, AuthRequirement, GuardLevel, JwtConfig, Principal,
    };
}

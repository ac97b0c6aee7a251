//! Authentication, session and authorization core.
//!
//! [`AuthService`] is the facade used by the HTTP layer. Its collaborators
//! (stores, cache, password hasher, two-factor verifier, clock) are trait
//! objects so tests can run entirely in memory.

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod password;
pub mod rbac;
pub mod service;
pub mod session;
pub mod store;
pub mod token;
pub mod two_factor;
pub mod utils;

pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use models::{Origin, PermissionKey, Profile, Role, User};
pub use rbac::ADMIN_ROLE;
pub use service::{AuthService, AuthServiceBuilder, LoginResponse};
pub use token::Claims;

//! Route handlers. Each is documented with `#[utoipa::path]` and registered in
//! `openapi.rs`.

pub mod auth;
pub mod health;
pub mod roles;

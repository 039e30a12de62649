//! Authentication module for the Billbridge API

pub mod jwt;
pub mod middleware;

pub use jwt::JwtManager;
pub use middleware::{require_auth, AuthState, AuthUser};

//! Authentication against the hosted auth service
//!
//! Email/password sign-in and refresh-token renewal. Tokens are kept in the
//! config file; the access token's user id doubles as the caller identity
//! (`sender_id`) for call signaling.

pub mod password;
pub mod tokens;

pub use password::{active_session, login, logout, status};
pub use tokens::{StoredToken, TokenStore};

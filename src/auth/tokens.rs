//! Token storage and management

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds before expiry at which a token is treated as already expired.
const EXPIRY_MARGIN_SECS: u64 = 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Stored access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    pub expires_at: Option<u64>,
}

impl StoredToken {
    pub fn new(token: String, expires_in_secs: Option<u64>) -> Self {
        let expires_at = expires_in_secs.map(|secs| now_secs() + secs);
        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => now_secs() + EXPIRY_MARGIN_SECS >= exp,
            None => false,
        }
    }
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn get_access_token(&self) -> Option<StoredToken>;
    fn set_access_token(&mut self, token: String, expires_in: Option<u64>);
    fn get_refresh_token(&self) -> Option<String>;
    fn set_refresh_token(&mut self, token: String);
    fn clear_tokens(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_without_expiry_never_expires() {
        assert!(!StoredToken::new("t".into(), None).is_expired());
    }

    #[test]
    fn test_expiry_margin() {
        assert!(!StoredToken::new("t".into(), Some(3600)).is_expired());
        assert!(StoredToken::new("t".into(), Some(EXPIRY_MARGIN_SECS - 1)).is_expired());
        let stale = StoredToken {
            token: "t".into(),
            expires_at: Some(1),
        };
        assert!(stale.is_expired());
    }
}

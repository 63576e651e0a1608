//! User records and the pool-limit wire encoding

use serde::{Deserialize, Serialize};

use crate::event::ProtocolError;

/// Account status of an end user
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    #[serde(other)]
    Unknown,
}

/// User record carried by a `login_success` event
///
/// Pool bindings arrive in the compact `"tag:limit:usage"` string form;
/// use [`PoolLimit::parse`] to translate them at the boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserPayload {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub status: UserStatus,
    pub ip_whitelist: Vec<String>,
    pub pools: Vec<String>,
}

impl UserPayload {
    /// Translate the wire pool encoding into structured limits
    pub fn pool_limits(&self) -> Result<Vec<PoolLimit>, ProtocolError> {
        self.pools.iter().map(|raw| PoolLimit::parse(raw)).collect()
    }
}

/// Structured per-pool data limit for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimit {
    pub tag: String,
    pub data_limit: u64,
    pub data_usage: u64,
}

impl PoolLimit {
    /// Parse the `"tag:limit:usage"` wire form
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut parts = raw.splitn(3, ':');

        let tag = parts.next().filter(|t| !t.is_empty());
        let limit = parts.next().and_then(|p| p.parse::<u64>().ok());
        let usage = parts.next().and_then(|p| p.parse::<u64>().ok());

        match (tag, limit, usage) {
            (Some(tag), Some(data_limit), Some(data_usage)) => Ok(Self {
                tag: tag.to_string(),
                data_limit,
                data_usage,
            }),
            _ => Err(ProtocolError::InvalidPoolEncoding(raw.to_string())),
        }
    }

    /// True while the user still has quota left in this pool
    pub fn has_quota(&self) -> bool {
        self.data_usage < self.data_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_limit() {
        let limit = PoolLimit::parse("residential:1073741824:52428800").unwrap();
        assert_eq!(limit.tag, "residential");
        assert_eq!(limit.data_limit, 1_073_741_824);
        assert_eq!(limit.data_usage, 52_428_800);
        assert!(limit.has_quota());
    }

    #[test]
    fn test_parse_exhausted_quota() {
        let limit = PoolLimit::parse("dc:1000:1000").unwrap();
        assert!(!limit.has_quota());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(PoolLimit::parse("residential").is_err());
        assert!(PoolLimit::parse("residential:abc:5").is_err());
        assert!(PoolLimit::parse(":100:5").is_err());
    }

    #[test]
    fn test_user_status_decoding() {
        let raw = r#"{"id":1,"username":"a","password":"b","status":"active","ip_whitelist":[],"pools":[]}"#;
        let user: UserPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(user.status, UserStatus::Active);

        let raw = r#"{"id":1,"username":"a","password":"b","status":"banned","ip_whitelist":[],"pools":[]}"#;
        let user: UserPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(user.status, UserStatus::Unknown);
    }

    #[test]
    fn test_pool_limits_translation() {
        let user = UserPayload {
            id: 9,
            username: "alice".to_string(),
            password: "pw".to_string(),
            status: UserStatus::Active,
            ip_whitelist: vec![],
            pools: vec!["res:100:10".to_string(), "dc:200:20".to_string()],
        };

        let limits = user.pool_limits().unwrap();
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[1].tag, "dc");
    }
}

//! State leases.
//!
//! A lease gives one plan exclusive write access to a state target. It
//! carries the version token the holder is allowed to write against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default lease lifetime in seconds.
pub const LEASE_TTL_SECS: i64 = 3600;

/// Information about a held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Unique lease identifier.
    pub lease_id: String,
    /// Who holds the lease.
    pub holder: String,
    /// State version the holder last wrote or read.
    pub version: u64,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    /// Creates a lease for `holder` at `version`.
    #[must_use]
    pub fn new(holder: &str, version: u64, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            lease_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            version,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        }
    }

    /// Checks if the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_creation() {
        let lease = LeaseInfo::new("ci", 7, LEASE_TTL_SECS);
        assert_eq!(lease.holder, "ci");
        assert_eq!(lease.version, 7);
        assert!(!lease.is_expired());
        assert!(lease.remaining_secs() > 0);

        let expired = LeaseInfo::new("ci", 7, -1);
        assert!(expired.is_expired());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}

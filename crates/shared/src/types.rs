//! Common types used across Quotaflow

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Wrappers
// =============================================================================

/// Internal organization (tenant) ID
///
/// Organizations are keyed by an integer internally; the billing provider only
/// knows them by their external customer id. `OrgId::default()` (0) is never
/// assigned to a real organization.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OrgId(pub i32);

impl OrgId {
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl From<i32> for OrgId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OrgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OrgId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i32>().map(Self)
    }
}

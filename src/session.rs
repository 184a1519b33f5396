//! Session context carried with each query.
//!
//! ## Invariants
//!
//! - No silent bypass: skipping the rewrite requires an explicit service
//!   role
//! - Anonymous sessions satisfy no rule that mentions the current user

use std::collections::BTreeMap;

use uuid::Uuid;

/// Bound parameters of a query; the rewrite engine may add synthetic keys
/// (the generated substitution for the current user's eid).
pub type Params = BTreeMap<String, serde_json::Value>;

/// The principal a query runs as.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// The authenticated user's eid (None if anonymous)
    pub user_eid: Option<Uuid>,

    /// Whether using the service role (bypasses rewriting)
    pub is_service_role: bool,
}

impl SessionContext {
    /// Context for an authenticated user.
    pub fn authenticated(user_eid: Uuid) -> Self {
        Self {
            user_eid: Some(user_eid),
            is_service_role: false,
        }
    }

    /// Context for anonymous access.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Context for the service role (bypasses rewriting).
    pub fn service_role() -> Self {
        Self {
            user_eid: None,
            is_service_role: true,
        }
    }

    /// Check if this context allows skipping the rewrite entirely.
    pub fn can_bypass_rewrite(&self) -> bool {
        self.is_service_role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticated_context() {
        let eid = Uuid::new_v4();
        let ctx = SessionContext::authenticated(eid);
        assert_eq!(ctx.user_eid, Some(eid));
        assert!(!ctx.can_bypass_rewrite());
    }

    #[test]
    fn test_service_role_bypass() {
        assert!(SessionContext::service_role().can_bypass_rewrite());
        assert!(!SessionContext::anonymous().can_bypass_rewrite());
    }
}

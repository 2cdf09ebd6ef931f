use fleetward_core::HolderId;
use serde::{Deserialize, Serialize};

/// Time-bounded ownership claim embedded in a document.
///
/// `expires_at` is unix seconds stamped by the document store at commit
/// time; clients never compute it from their own clocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "leaseOwner", default, skip_serializing_if = "Option::is_none")]
    owner: Option<HolderId>,
    #[serde(rename = "leaseExpires", default)]
    expires_at: i64,
}

impl Lease {
    /// Returns the current owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<HolderId> {
        self.owner
    }

    /// Returns the lease expiry in unix seconds (0 when never leased).
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Returns true when `holder_id` is the recorded owner.
    #[must_use]
    pub fn is_held_by(&self, holder_id: HolderId) -> bool {
        self.owner == Some(holder_id)
    }

    /// Returns true while the lease expiry lies after `now`.
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// Returns true when `holder_id` may take the lease at `now`.
    #[must_use]
    pub fn is_available_to(&self, holder_id: HolderId, now: i64) -> bool {
        !self.is_active(now) || self.is_held_by(holder_id)
    }

    /// Records `holder_id` as owner. Expiry is stamped by the store.
    pub fn claim(&mut self, holder_id: HolderId) {
        self.owner = Some(holder_id);
    }

    /// Clears owner and expiry so the document is immediately claimable.
    pub fn clear(&mut self) {
        self.owner = None;
        self.expires_at = 0;
    }

    /// Clears the owner but keeps the expiry, leaving the document
    /// unclaimable until the stamped expiry passes.
    pub fn disown(&mut self) {
        self.owner = None;
    }

    /// Sets the expiry. Only store implementations call this.
    pub fn set_expires_at(&mut self, expires_at: i64) {
        self.expires_at = expires_at;
    }
}

#[cfg(test)]
mod tests {
    use fleetward_core::HolderId;

    use super::Lease;

    #[test]
    fn unowned_lease_is_available_to_anyone() {
        let lease = Lease::default();
        assert!(lease.is_available_to(HolderId::new(), 0));
    }

    #[test]
    fn active_lease_is_only_available_to_owner() {
        let owner = HolderId::new();
        let mut lease = Lease::default();
        lease.claim(owner);
        lease.set_expires_at(160);

        assert!(lease.is_available_to(owner, 100));
        assert!(!lease.is_available_to(HolderId::new(), 100));
        assert!(lease.is_available_to(HolderId::new(), 160));
    }

    #[test]
    fn disowned_lease_stays_blocked_until_expiry() {
        let mut lease = Lease::default();
        lease.claim(HolderId::new());
        lease.set_expires_at(700);
        lease.disown();

        assert!(lease.owner().is_none());
        assert!(!lease.is_available_to(HolderId::new(), 100));
    }

    #[test]
    fn lease_serializes_with_persisted_field_names() {
        let mut lease = Lease::default();
        lease.set_expires_at(42);
        let value = serde_json::to_value(lease).unwrap_or_default();
        assert_eq!(value, serde_json::json!({"leaseExpires": 42}));
    }
}

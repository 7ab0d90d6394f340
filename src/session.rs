//! Single-owner session slot.
//!
//! At most one connection owns the service at any time. Ownership is proved
//! by a freshness token pair `(session_id, owner_token)`; a takeover mints a
//! fresh pair, so frames from the displaced owner can never be applied.

use chrono::{DateTime, Utc};
use log::info;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use uuid::Uuid;

const OWNER_TOKEN_LEN: usize = 32;

/// The installed owner.
#[derive(Debug, Clone)]
pub struct OwnerSlot {
    pub conn_id: u64,
    pub session_id: String,
    pub owner_token: String,
    pub since: DateTime<Utc>,
}

/// Credentials handed to a newly granted owner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub session_id: String,
    pub owner_token: String,
    pub since: DateTime<Utc>,
}

/// Outcome of a connection arrival.
#[derive(Debug)]
pub enum Admission {
    Granted(Grant),
    Busy { owner_since: DateTime<Utc> },
}

#[derive(Debug, Default)]
pub struct SessionManager {
    slot: Option<OwnerSlot>,
}

fn generate_owner_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OWNER_TOKEN_LEN)
        .map(char::from)
        .collect()
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager::default()
    }

    pub fn owner(&self) -> Option<&OwnerSlot> {
        self.slot.as_ref()
    }

    pub fn is_owner_conn(&self, conn_id: u64) -> bool {
        self.slot.as_ref().map(|s| s.conn_id == conn_id).unwrap_or(false)
    }

    /// Admit a new connection: grant ownership if the slot is empty,
    /// otherwise report busy.
    pub fn admit(&mut self, conn_id: u64) -> Admission {
        match &self.slot {
            Some(owner) => Admission::Busy {
                owner_since: owner.since,
            },
            None => Admission::Granted(self.install(conn_id)),
        }
    }

    /// Install `conn_id` as the owner with a fresh token pair, returning
    /// the grant and the displaced owner's connection (if any).
    pub fn takeover(&mut self, conn_id: u64) -> (Grant, Option<OwnerSlot>) {
        let previous = self.slot.take();
        if let Some(prev) = &previous {
            info!(
                "session takeover: conn {} displaces conn {}",
                conn_id, prev.conn_id
            );
        }
        (self.install(conn_id), previous)
    }

    /// Freshness rule: an owner-authored message is applied only when its
    /// token pair matches the slot exactly.
    pub fn is_fresh(&self, session_id: Option<&str>, owner_token: Option<&str>) -> bool {
        match (&self.slot, session_id, owner_token) {
            (Some(owner), Some(sid), Some(token)) => {
                owner.session_id == sid && owner.owner_token == token
            }
            _ => false,
        }
    }

    /// Clear the slot when its connection goes away. Returns whether the
    /// disconnecting connection was the owner.
    pub fn clear_conn(&mut self, conn_id: u64) -> bool {
        if self.is_owner_conn(conn_id) {
            info!("owner connection {} disconnected, clearing slot", conn_id);
            self.slot = None;
            true
        } else {
            false
        }
    }

    fn install(&mut self, conn_id: u64) -> Grant {
        let slot = OwnerSlot {
            conn_id,
            session_id: Uuid::new_v4().to_string(),
            owner_token: generate_owner_token(),
            since: Utc::now(),
        };
        let grant = Grant {
            session_id: slot.session_id.clone(),
            owner_token: slot.owner_token.clone(),
            since: slot.since,
        };
        info!("session granted to conn {}", conn_id);
        self.slot = Some(slot);
        grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_is_granted() {
        let mut sessions = SessionManager::new();
        match sessions.admit(1) {
            Admission::Granted(grant) => {
                assert_eq!(grant.session_id.len(), 36);
                assert_eq!(grant.owner_token.len(), OWNER_TOKEN_LEN);
            }
            Admission::Busy { .. } => panic!("slot should be empty"),
        }
        assert!(sessions.is_owner_conn(1));
    }

    #[test]
    fn second_connection_sees_busy() {
        let mut sessions = SessionManager::new();
        sessions.admit(1);
        assert!(matches!(sessions.admit(2), Admission::Busy { .. }));
        assert!(sessions.is_owner_conn(1));
        assert!(!sessions.is_owner_conn(2));
    }

    #[test]
    fn takeover_mints_fresh_tokens_and_reports_old_owner() {
        let mut sessions = SessionManager::new();
        let first = match sessions.admit(1) {
            Admission::Granted(grant) => grant,
            Admission::Busy { .. } => panic!("slot should be empty"),
        };
        let (second, displaced) = sessions.takeover(2);
        assert_ne!(first.session_id, second.session_id);
        assert_ne!(first.owner_token, second.owner_token);
        assert_eq!(displaced.map(|o| o.conn_id), Some(1));
        assert!(sessions.is_owner_conn(2));
    }

    #[test]
    fn stale_tokens_fail_the_freshness_gate() {
        let mut sessions = SessionManager::new();
        let first = match sessions.admit(1) {
            Admission::Granted(grant) => grant,
            Admission::Busy { .. } => panic!("slot should be empty"),
        };
        assert!(sessions.is_fresh(Some(&first.session_id), Some(&first.owner_token)));

        sessions.takeover(2);
        assert!(!sessions.is_fresh(Some(&first.session_id), Some(&first.owner_token)));
        assert!(!sessions.is_fresh(None, None));
        assert!(!sessions.is_fresh(Some(&first.session_id), None));
    }

    #[test]
    fn owner_disconnect_clears_the_slot() {
        let mut sessions = SessionManager::new();
        sessions.admit(1);
        assert!(!sessions.clear_conn(2));
        assert!(sessions.owner().is_some());
        assert!(sessions.clear_conn(1));
        assert!(sessions.owner().is_none());
    }
}

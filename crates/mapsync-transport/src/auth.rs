//! Auth collaborators - consumed here, implemented elsewhere
//!
//! Session issuance and team/role machinery live outside this crate; the
//! transport only needs an identity for each credential and a yes/no per
//! map access check, re-run on every mutating message.

use mapsync_core::Actor;

/// Required access for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    View,
    Edit,
    Owner,
}

/// Resolves a caller's credential to an identity.
pub trait Authenticator: Send + Sync {
    /// `None` means the credential is missing or unusable; the connection
    /// is closed with [`mapsync_protocol::close_code::AUTH_REQUIRED`]
    /// before any message exchange.
    fn authenticate(&self, token: Option<&str>) -> Option<Actor>;
}

/// Per-map permission check.
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, user_id: Option<&str>, map_id: &str, level: AccessLevel) -> bool;
}

/// Permissive defaults: any credential (or none) is accepted and every
/// map is open. Real deployments plug in their own resolver and policy.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, token: Option<&str>) -> Option<Actor> {
        Some(match token {
            Some(token) => Actor::new(token, token),
            None => Actor::anonymous(),
        })
    }
}

impl AccessPolicy for AllowAll {
    fn can_access(&self, _user_id: Option<&str>, _map_id: &str, _level: AccessLevel) -> bool {
        true
    }
}

// Identity verification and the user whitelist
// The signed-handshake check is modelled as a trait so the gateway and the
// HTTP surface stay independent of the platform's signing scheme. A user
// absent from the directory is denied all access; promotion and demotion
// only flip the admin flag.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity extracted from a verified handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
}

/// Opaque "verify identity" collaborator. Returns `None` for any payload
/// that fails verification; verification never panics.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, init_data: &str) -> Option<VerifiedIdentity>;
}

/// Signature check over the platform handshake payload.
///
/// The payload is a form-encoded field list carrying a `hash` field. The
/// signature is the hex SHA-256 of the secret followed by the remaining
/// fields as sorted `key=value` lines.
pub struct SignedPayloadVerifier {
    secret: String,
}

impl SignedPayloadVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Compute the expected signature for a field set. Exposed so tests and
    /// local tooling can mint valid payloads.
    pub fn sign(&self, fields: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        for (key, value) in fields {
            hasher.update(b"\n");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl IdentityVerifier for SignedPayloadVerifier {
    fn verify(&self, init_data: &str) -> Option<VerifiedIdentity> {
        let mut fields = BTreeMap::new();
        for pair in init_data.split('&') {
            let (key, value) = pair.split_once('=')?;
            let value = urlencoding::decode(value).ok()?.into_owned();
            fields.insert(key.to_string(), value);
        }

        let presented = fields.remove("hash")?;
        if self.sign(&fields) != presented {
            return None;
        }

        let user_id = fields.get("userId")?.clone();
        if user_id.is_empty() {
            return None;
        }
        Some(VerifiedIdentity {
            user_id,
            first_name: fields.get("firstName").cloned().unwrap_or_default(),
            last_name: fields.get("lastName").cloned().unwrap_or_default(),
            username: fields.get("username").cloned().unwrap_or_default(),
        })
    }
}

// ============================================================================
// USER DIRECTORY
// ============================================================================

/// A whitelisted platform user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

/// Whitelist plus admin flags, persisted as a single settings record.
/// Membership in the directory is the whitelist: unknown users are denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDirectory {
    users: HashMap<String, User>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn is_whitelisted(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.users.get(user_id).is_some_and(|user| user.is_admin)
    }

    /// Add or replace a user. Granting access to an existing id refreshes
    /// the profile but keeps the stronger admin flag.
    pub fn grant(&mut self, mut user: User) {
        if let Some(existing) = self.users.get(&user.id) {
            user.is_admin = user.is_admin || existing.is_admin;
        }
        self.users.insert(user.id.clone(), user);
    }

    /// Remove a user from the whitelist entirely.
    pub fn revoke(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    /// Flip the admin flag on. Returns false for unknown users.
    pub fn promote(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.is_admin = true;
                true
            }
            None => false,
        }
    }

    /// Flip the admin flag off. Returns false for unknown users.
    pub fn demote(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.is_admin = false;
                true
            }
            None => false,
        }
    }

    /// Refresh display-name fields from a verified handshake.
    pub fn update_profile(&mut self, identity: &VerifiedIdentity) {
        if let Some(user) = self.users.get_mut(&identity.user_id) {
            user.first_name = identity.first_name.clone();
            user.last_name = identity.last_name.clone();
            user.username = identity.username.clone();
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

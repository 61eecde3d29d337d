//! API keys other instances use to call into this one
//!
//! The raw secret is returned exactly once, from [`ApiKeyRegistry::create`].
//! Only a salted SHA-256 hash is persisted. Validation reads the table on
//! every call, so a revocation is visible to the very next request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{format_ts, parse_ts, parse_uuid, Database};

/// Prefix that makes secrets recognizable in logs and config files
pub const KEY_PREFIX: &str = "adb_";

/// Number of random bytes in a secret
const SECRET_BYTES: usize = 32;

/// Stored key metadata (never includes the secret)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    /// Key id
    pub id: Uuid,
    /// Operator-supplied label
    pub label: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Instance that has announced itself with this key, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_instance_id: Option<Uuid>,
}

/// A freshly created key, including the raw secret
#[derive(Debug, Clone)]
pub struct NewApiKey {
    /// Stored metadata
    pub info: ApiKeyInfo,
    /// Raw secret; not recoverable after this value is dropped
    pub secret: String,
}

/// Issues, validates and revokes inbound credentials
pub struct ApiKeyRegistry {
    db: Arc<Database>,
}

impl ApiKeyRegistry {
    /// Create a registry over the shared database
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Issue a new key
    pub fn create(&self, label: &str) -> Result<NewApiKey> {
        let label = label.trim();
        if label.is_empty() {
            return Err(Error::validation("key label must not be empty"));
        }

        let mut rng = rand::thread_rng();
        let mut secret_bytes = [0u8; SECRET_BYTES];
        rng.fill_bytes(&mut secret_bytes);
        let mut salt = [0u8; 16];
        rng.fill_bytes(&mut salt);

        let secret = format!("{KEY_PREFIX}{}", hex::encode(secret_bytes));
        let salt_hex = hex::encode(salt);
        let secret_hash = hash_secret(&salt_hex, &secret);

        let info = ApiKeyInfo {
            id: Uuid::new_v4(),
            label: label.to_string(),
            created_at: Utc::now(),
            bound_instance_id: None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO api_keys (id, label, salt, secret_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                [
                    info.id.to_string(),
                    info.label.clone(),
                    salt_hex,
                    secret_hash,
                    format_ts(&info.created_at),
                ],
            )
        })?;

        info!(key_id = %info.id, label = %info.label, "API key created");
        Ok(NewApiKey { info, secret })
    }

    /// Check a raw secret, returning the id of the matching key
    pub fn validate(&self, secret: &str) -> Result<Uuid> {
        if secret.is_empty() {
            return Err(Error::auth("missing API key"));
        }

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, salt, secret_hash FROM api_keys")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        // Compare against every row so timing does not reveal which key matched
        let mut matched = None;
        for (id, salt, stored_hash) in &rows {
            let candidate = hash_secret(salt, secret);
            if constant_time_eq(candidate.as_bytes(), stored_hash.as_bytes()) {
                matched = Some(id.clone());
            }
        }

        match matched {
            Some(id) => Uuid::parse_str(&id)
                .map_err(|e| Error::storage(format!("corrupt key id {id}: {e}"))),
            None => {
                debug!("Rejected unknown or revoked API key");
                Err(Error::auth("invalid or revoked API key"))
            }
        }
    }

    /// Delete a key. Takes effect on the next `validate`.
    pub fn revoke(&self, id: Uuid) -> Result<()> {
        let removed = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM api_keys WHERE id = ?1", [id.to_string()])
        })?;

        if removed == 0 {
            warn!(key_id = %id, "Revocation of unknown API key");
            return Err(Error::not_found(format!("API key {id}")));
        }
        info!(key_id = %id, "API key revoked");
        Ok(())
    }

    /// Tie a key to the instance announcing with it.
    ///
    /// The first announce binds the key. Announces for any other instance
    /// made with the same key are refused with `Auth`, so one key holder
    /// cannot rewrite another peer's address.
    pub fn bind_instance(&self, key_id: Uuid, instance_id: Uuid) -> Result<()> {
        let bound = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE api_keys SET bound_instance_id = ?2 WHERE id = ?1 AND bound_instance_id IS NULL",
                [key_id.to_string(), instance_id.to_string()],
            )?;
            conn.query_row(
                "SELECT bound_instance_id FROM api_keys WHERE id = ?1",
                [key_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
        })?;

        match bound.flatten() {
            Some(bound) if bound == instance_id.to_string() => Ok(()),
            Some(bound) => {
                warn!(key_id = %key_id, bound = %bound, claimed = %instance_id, "Announce for another instance refused");
                Err(Error::auth("API key belongs to another instance"))
            }
            None => Err(Error::auth("invalid or revoked API key")),
        }
    }

    /// List keys, oldest first
    pub fn list(&self) -> Result<Vec<ApiKeyInfo>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, label, created_at, bound_instance_id FROM api_keys ORDER BY created_at, rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let created_at: String = row.get(2)?;
                let bound: Option<String> = row.get(3)?;
                Ok(ApiKeyInfo {
                    id: parse_uuid(&id)?,
                    label: row.get(1)?,
                    created_at: parse_ts(&created_at)?,
                    bound_instance_id: bound.as_deref().map(parse_uuid).transpose()?,
                })
            })?;
            rows.collect()
        })
    }
}

fn hash_secret(salt_hex: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Byte comparison whose running time depends only on the length
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ApiKeyRegistry {
        ApiKeyRegistry::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_create_returns_prefixed_secret_once() {
        let keys = registry();
        let new_key = keys.create("laptop").unwrap();

        assert!(new_key.secret.starts_with(KEY_PREFIX));
        assert_eq!(new_key.secret.len(), KEY_PREFIX.len() + SECRET_BYTES * 2);

        // The secret is not stored anywhere in plain form
        let stored: String = keys
            .db
            .with_conn(|conn| conn.query_row("SELECT secret_hash FROM api_keys", [], |r| r.get(0)))
            .unwrap();
        assert_ne!(stored, new_key.secret);
        assert!(!stored.contains(&new_key.secret[KEY_PREFIX.len()..]));
    }

    #[test]
    fn test_validate_accepts_matching_key() {
        let keys = registry();
        let a = keys.create("a").unwrap();
        let b = keys.create("b").unwrap();

        assert_eq!(keys.validate(&a.secret).unwrap(), a.info.id);
        assert_eq!(keys.validate(&b.secret).unwrap(), b.info.id);
        assert!(matches!(keys.validate("adb_nope"), Err(Error::Auth(_))));
        assert!(matches!(keys.validate(""), Err(Error::Auth(_))));
    }

    #[test]
    fn test_revoke_takes_effect_immediately() {
        let keys = registry();
        let key = keys.create("peer").unwrap();
        keys.validate(&key.secret).unwrap();

        keys.revoke(key.info.id).unwrap();

        assert!(matches!(keys.validate(&key.secret), Err(Error::Auth(_))));
        assert!(matches!(keys.revoke(key.info.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_omits_secrets() {
        let keys = registry();
        keys.create("first").unwrap();
        keys.create("second").unwrap();

        let listed = keys.list().unwrap();
        let labels: Vec<_> = listed.iter().map(|k| k.label.as_str()).collect();
        assert_eq!(labels, vec!["first", "second"]);
    }

    #[test]
    fn test_first_announcing_instance_owns_the_key() {
        let keys = registry();
        let key = keys.create("peer").unwrap();
        let owner = Uuid::new_v4();

        keys.bind_instance(key.info.id, owner).unwrap();
        keys.bind_instance(key.info.id, owner).unwrap();
        assert!(matches!(
            keys.bind_instance(key.info.id, Uuid::new_v4()),
            Err(Error::Auth(_))
        ));
        assert_eq!(keys.list().unwrap()[0].bound_instance_id, Some(owner));

        // A second key is independent
        let other = keys.create("other").unwrap();
        keys.bind_instance(other.info.id, Uuid::new_v4()).unwrap();

        keys.revoke(key.info.id).unwrap();
        assert!(matches!(keys.bind_instance(key.info.id, owner), Err(Error::Auth(_))));
    }

    #[test]
    fn test_empty_label_rejected() {
        let keys = registry();
        assert!(matches!(keys.create("  "), Err(Error::Validation(_))));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}

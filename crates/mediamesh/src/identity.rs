//! Instance identity management
//!
//! Each instance has a permanent UUID generated on first run. Peers refer to
//! us by this id, never by address, which is what lets the mesh heal itself
//! when addresses change.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{format_ts, Database};

/// This instance's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// Permanent instance id
    pub id: Uuid,
    /// Display name shown to peers
    pub name: String,
}

/// Holds the instance identity, loaded once at startup
pub struct IdentityStore {
    db: Arc<Database>,
    current: RwLock<InstanceIdentity>,
}

impl IdentityStore {
    /// Load the existing identity, or create one named `default_name`
    pub fn load_or_create(db: Arc<Database>, default_name: &str) -> Result<Self> {
        let existing = db.with_conn(|conn| {
            conn.query_row("SELECT id, name FROM instance WHERE singleton = 1", [], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()
        })?;

        let identity = match existing {
            Some((id, name)) => {
                let id = Uuid::parse_str(&id)
                    .map_err(|e| Error::init(format!("stored instance id is corrupt: {e}")))?;
                info!(instance_id = %id, name = %name, "Loaded existing instance identity");
                InstanceIdentity { id, name }
            }
            None => {
                debug!("Generating new instance identity");
                let identity = InstanceIdentity {
                    id: Uuid::new_v4(),
                    name: default_name.to_string(),
                };
                db.with_conn(|conn| {
                    // OR IGNORE: a concurrent first start must not replace an id already written
                    conn.execute(
                        "INSERT OR IGNORE INTO instance (singleton, id, name, created_at)
                         VALUES (1, ?1, ?2, ?3)",
                        [
                            identity.id.to_string(),
                            identity.name.clone(),
                            format_ts(&Utc::now()),
                        ],
                    )
                })?;
                info!(instance_id = %identity.id, name = %identity.name, "Generated new instance identity");
                identity
            }
        };

        Ok(Self {
            db,
            current: RwLock::new(identity),
        })
    }

    /// Current identity
    pub fn get(&self) -> InstanceIdentity {
        self.current.read().clone()
    }

    /// Permanent instance id
    pub fn id(&self) -> Uuid {
        self.current.read().id
    }

    /// Display name
    pub fn name(&self) -> String {
        self.current.read().name.clone()
    }

    /// Change the display name. The id is untouched.
    pub fn rename(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("instance name must not be empty"));
        }
        self.db.with_conn(|conn| {
            conn.execute("UPDATE instance SET name = ?1 WHERE singleton = 1", [name])
        })?;
        self.current.write().name = name.to_string();
        info!(name, "Instance renamed");
        Ok(())
    }
}

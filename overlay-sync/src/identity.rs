//! Identity normalization.
//!
//! Records from the remote service sometimes carry their key under the
//! primary attribute, sometimes under a legacy alias, and optimistic creations
//! start under a client id that the server may replace. Every id goes through
//! [`IdentityMap::resolve`] before it is used as a map key.

use std::collections::HashMap;

use shared_types::{Entity, EntityId};

/// Record attributes that carry an entity id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    pub primary: String,
    pub aliases: Vec<String>,
}

impl Default for IdentityKeys {
    fn default() -> Self {
        Self {
            primary: "id".to_string(),
            aliases: vec!["_id".to_string()],
        }
    }
}

/// Bound on alias chains (temp -> server -> renamed); guards against cycles.
const MAX_ALIAS_HOPS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    keys: IdentityKeys,
    aliases: HashMap<EntityId, EntityId>,
}

impl IdentityMap {
    pub fn new(keys: IdentityKeys) -> Self {
        Self {
            keys,
            aliases: HashMap::new(),
        }
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    /// Record that `alias` names the same entity as `primary`.
    pub fn learn(&mut self, alias: EntityId, primary: EntityId) {
        let primary = self.resolve(&primary);
        if alias == primary {
            return;
        }
        tracing::trace!(alias = %alias, primary = %primary, "Learned entity alias");
        self.aliases.insert(alias, primary);
    }

    pub fn resolve(&self, id: &EntityId) -> EntityId {
        let mut current = id;
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current.clone()
    }

    pub fn resolve_raw(&self, raw: &str) -> EntityId {
        self.resolve(&EntityId::canonical(raw))
    }

    /// Read the id attributes of a raw record, learning aliases on the way.
    pub fn id_of_record(&mut self, record: &serde_json::Value) -> Option<EntityId> {
        let primary = record.get(&self.keys.primary).and_then(EntityId::from_value);
        let aliases: Vec<EntityId> = self
            .keys
            .aliases
            .iter()
            .filter_map(|key| record.get(key).and_then(EntityId::from_value))
            .collect();

        match primary {
            Some(primary) => {
                for alias in aliases {
                    self.learn(alias, primary.clone());
                }
                Some(self.resolve(&primary))
            }
            None => aliases.first().map(|alias| self.resolve(alias)),
        }
    }

    /// Convert a raw record into an [`Entity`] keyed by its canonical id.
    /// Records without any id attribute are dropped.
    pub fn entity_from_record(&mut self, record: serde_json::Value) -> Option<Entity> {
        let id = self.id_of_record(&record)?;
        match record {
            serde_json::Value::Object(fields) => Some(Entity::new(id, fields)),
            _ => None,
        }
    }
}

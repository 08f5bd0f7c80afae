//! Destination routing descriptor
//!
//! Maps `(meta_destination_id, meta_ext_event)` to the ordered list of destination
//! stores an upload is replicated to. Loaded once at startup from JSON.

use anyhow::{Context, Result};
use ferry_core::models::{Destination, RoutingKey};
use ferry_storage::{create_storage, Storage, StorageTarget};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub destination_id: String,
    pub ext_event: String,
    pub targets: Vec<Destination>,
}

/// On-disk routing document
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    pub routes: Vec<RouteConfig>,
    pub targets: HashMap<Destination, StorageTarget>,
}

impl RoutingConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Invalid routing configuration")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read routing configuration {}", path.display()))?;
        Self::from_json(&raw)
    }
}

/// A destination store resolved for one route
#[derive(Clone)]
pub struct RouteTarget {
    pub destination: Destination,
    pub storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTarget")
            .field("destination", &self.destination)
            .field("backend", &self.storage.backend_type())
            .finish()
    }
}

pub struct RoutingTable {
    routes: HashMap<RoutingKey, Vec<Destination>>,
    stores: HashMap<Destination, Arc<dyn Storage>>,
}

impl RoutingTable {
    /// Build the table from already constructed stores. Every destination a route names
    /// must have a store.
    pub fn new(
        routes: Vec<RouteConfig>,
        stores: HashMap<Destination, Arc<dyn Storage>>,
    ) -> Result<Self> {
        let mut table = HashMap::new();
        for route in routes {
            let key = RoutingKey {
                meta_destination_id: route.destination_id,
                meta_ext_event: route.ext_event,
            };
            if route.targets.is_empty() {
                anyhow::bail!("Route {} has no targets", key);
            }
            let mut targets: Vec<Destination> = Vec::with_capacity(route.targets.len());
            for destination in route.targets {
                if !stores.contains_key(&destination) {
                    anyhow::bail!("Route {} names unconfigured destination {}", key, destination);
                }
                if !targets.contains(&destination) {
                    targets.push(destination);
                }
            }
            if table.insert(key.clone(), targets).is_some() {
                anyhow::bail!("Duplicate route {}", key);
            }
        }

        Ok(Self {
            routes: table,
            stores,
        })
    }

    /// Create the destination stores named in `config` and build the table.
    pub async fn from_config(config: RoutingConfig) -> Result<Self> {
        let mut stores: HashMap<Destination, Arc<dyn Storage>> = HashMap::new();
        for (destination, target) in &config.targets {
            let storage = create_storage(target)
                .await
                .with_context(|| format!("Failed to create store for {}", destination))?;
            tracing::info!(
                destination = %destination,
                backend = %target.backend,
                "Destination store configured"
            );
            stores.insert(*destination, storage);
        }
        Self::new(config.routes, stores)
    }

    pub fn contains(&self, key: &RoutingKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Destination stores for a routing descriptor, in configured order.
    pub fn resolve(&self, key: &RoutingKey) -> Option<Vec<RouteTarget>> {
        let destinations = self.routes.get(key)?;
        Some(
            destinations
                .iter()
                .filter_map(|destination| {
                    self.stores.get(destination).map(|storage| RouteTarget {
                        destination: *destination,
                        storage: Arc::clone(storage),
                    })
                })
                .collect(),
        )
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dest: &str, event: &str) -> RoutingKey {
        RoutingKey {
            meta_destination_id: dest.to_string(),
            meta_ext_event: event.to_string(),
        }
    }

    fn config(dir: &Path) -> RoutingConfig {
        let raw = format!(
            r#"{{
                "routes": [
                    {{ "destination_id": "dextesting", "ext_event": "testevent1", "targets": ["dex", "edav"] }},
                    {{ "destination_id": "ndlp", "ext_event": "routineImmunization", "targets": ["edav"] }}
                ],
                "targets": {{
                    "dex": {{ "backend": "local", "path": "{0}/dex" }},
                    "edav": {{ "backend": "local", "path": "{0}/edav" }}
                }}
            }}"#,
            dir.display()
        );
        RoutingConfig::from_json(&raw).unwrap()
    }

    #[tokio::test]
    async fn resolves_targets_in_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let table = RoutingTable::from_config(config(dir.path())).await.unwrap();

        let targets = table.resolve(&key("dextesting", "testevent1")).unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.destination).collect();
        assert_eq!(names, vec![Destination::Dex, Destination::Edav]);

        assert!(table.contains(&key("ndlp", "routineImmunization")));
        assert!(table.resolve(&key("ndlp", "other")).is_none());
        assert_eq!(table.route_count(), 2);
    }

    #[tokio::test]
    async fn rejects_route_to_unconfigured_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.targets.remove(&Destination::Edav);
        assert!(RoutingTable::from_config(config).await.is_err());
    }

    #[test]
    fn rejects_unknown_destination_name() {
        let raw = r#"{ "routes": [ { "destination_id": "a", "ext_event": "b", "targets": ["nope"] } ], "targets": {} }"#;
        assert!(RoutingConfig::from_json(raw).is_err());
    }
}

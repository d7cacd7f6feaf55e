//! Endpoints published by opened containers during one start run.

use crate::{CoreError, UnresolvedKind};
use dockyard_schema::{Definition, RelationshipEndpoint, RelationshipRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Append-only list of endpoints. A fresh registry is built for every start
/// run; nothing carries over between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipRegistry {
    endpoints: Vec<RelationshipEndpoint>,
}

impl RelationshipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, endpoint: RelationshipEndpoint) {
        self.endpoints.push(endpoint);
    }

    pub fn extend(&mut self, endpoints: impl IntoIterator<Item = RelationshipEndpoint>) {
        self.endpoints.extend(endpoints);
    }

    pub fn endpoints(&self) -> &[RelationshipEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Every endpoint matching the exact `(service, endpoint)` pair, in
    /// publication order.
    pub fn lookup(&self, reference: &RelationshipRef) -> Vec<RelationshipEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.matches(reference))
            .cloned()
            .collect()
    }

    /// Resolve each declared relationship of `def` to its matching endpoints,
    /// keyed by local relationship name.
    ///
    /// A reference with no match is an unresolved relationship. All such
    /// references are reported together.
    pub fn resolve(
        &self,
        def: &Definition,
    ) -> Result<BTreeMap<String, Vec<RelationshipEndpoint>>, CoreError> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        for (local, reference) in def.relationships()? {
            let matches = self.lookup(&reference);
            if matches.is_empty() {
                missing.push(format!("{}.{local} -> {reference}", def.name()));
            } else {
                resolved.insert(local, matches);
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::UnresolvedRelationship {
                kind: UnresolvedKind::Missing,
                names: missing,
            });
        }
        Ok(resolved)
    }
}

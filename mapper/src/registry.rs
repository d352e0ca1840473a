// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Table of active mappings, keyed by their canonical host key.
//!
//! The registry has no locking of its own: the [`PortMapper`](crate::PortMapper) owns it behind
//! the same lock that serializes every mapping operation.

use crate::addr::MappingKey;
use crate::mapping::Mapping;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MappingRegistry(HashMap<MappingKey, Mapping>);

impl MappingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Insert a mapping, unless the key is already taken. Returns `false`, leaving the registry
    /// untouched, on conflict; the rejected mapping is dropped.
    pub fn insert_if_absent(&mut self, key: MappingKey, mapping: Mapping) -> bool {
        if self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, mapping);
        true
    }

    #[must_use]
    pub fn contains(&self, key: &MappingKey) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn lookup(&self, key: &MappingKey) -> Option<&Mapping> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &MappingKey) -> Option<Mapping> {
        self.0.remove(key)
    }

    /// Visit all entries, in no particular order.
    pub fn for_each<F: FnMut(&MappingKey, &Mapping)>(&self, mut f: F) {
        for (key, mapping) in &self.0 {
            f(key, mapping);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &MappingKey> {
        self.0.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

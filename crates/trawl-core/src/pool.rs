use std::collections::BTreeMap;

use crate::types::{ClientId, Identity, IdentityKey};

/// The fixed set of egress identities and their lease state.
///
/// No persistence: the pool is rebuilt from configuration at startup, with
/// every identity free. Identity leases are session-scoped and carry no
/// deadline; reclamation happens on the holder's next register call.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    identities: BTreeMap<IdentityKey, Identity>,
    leased: BTreeMap<IdentityKey, ClientId>,
}

impl IdentityPool {
    pub fn new(identities: &[Identity]) -> Self {
        Self {
            identities: identities
                .iter()
                .map(|identity| (identity.key.clone(), identity.clone()))
                .collect(),
            leased: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Identity> {
        self.identities.get(key)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }

    pub fn is_leased_to(&self, key: &IdentityKey, client: &ClientId) -> bool {
        self.leased.get(key) == Some(client)
    }

    /// Free identities in stable key order.
    pub fn free_keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.identities
            .keys()
            .filter(|key| !self.leased.contains_key(*key))
    }

    /// Marks a free identity leased. Returns false if already held.
    pub fn lease(&mut self, key: &IdentityKey, client: ClientId) -> bool {
        if !self.identities.contains_key(key) || self.leased.contains_key(key) {
            return false;
        }
        self.leased.insert(key.clone(), client);
        true
    }

    /// Frees whatever identity the client currently holds.
    pub fn release_client(&mut self, client: &ClientId) -> Option<IdentityKey> {
        let key = self
            .leased
            .iter()
            .find(|(_, holder)| *holder == client)
            .map(|(key, _)| key.clone())?;
        self.leased.remove(&key);
        Some(key)
    }
}

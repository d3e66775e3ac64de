//! Per-direction table of class names to compact integer ids.
//!
//! Each connection owns two registries: one for ids it assigns when sending and
//! one for ids its peer assigned. Ids are handed out sequentially and are never
//! reused, even after [`ClassRegistry::remove`].

use crate::error::{ProtocolError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
    next_id: u32,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Return the id for `name`, allocating the next one on first use.
    ///
    /// The flag is true when the id was allocated by this call.
    pub fn assign(&mut self, name: &str) -> Result<(u32, bool)> {
        if let Some(id) = self.id_of(name) {
            return Ok((id, false));
        }
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .ok_or_else(|| ProtocolError::Custom("class id space exhausted".into()))?;
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        Ok((id, true))
    }

    /// Record a pair assigned by the remote sender.
    ///
    /// Any previous mapping for either the name or the id is replaced so the
    /// table stays one-to-one.
    pub fn register(&mut self, name: &str, id: u32) {
        if let Some(old_id) = self.by_name.insert(name.to_string(), id) {
            if old_id != id {
                self.by_id.remove(&old_id);
            }
        }
        if let Some(old_name) = self.by_id.insert(id, name.to_string()) {
            if old_name != name {
                self.by_name.remove(&old_name);
            }
        }
        if id >= self.next_id {
            self.next_id = id.saturating_add(1);
        }
    }

    /// Forget `name`. Its id is retired, not recycled.
    pub fn remove(&mut self, name: &str) -> Option<u32> {
        let id = self.by_name.remove(name)?;
        self.by_id.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

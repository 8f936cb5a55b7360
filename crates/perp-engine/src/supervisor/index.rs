//! Runner indices: symbol → runners for broadcast, uuid → runner for
//! lifecycle events.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use perp_common::Mark;

use crate::runner::RunnerHandle;

/// Shared runner index.
///
/// The symbol map sits behind a reader-writer lock: broadcasts take the
/// read side many times per second, mutations are rare. Mark delivery
/// inside the read section is a non-blocking `try_send`, so the lock is
/// never held across a wait.
#[derive(Default)]
pub struct RunnerIndex {
    by_symbol: RwLock<HashMap<String, HashMap<Uuid, Arc<RunnerHandle>>>>,
    by_uuid: DashMap<Uuid, Arc<RunnerHandle>>,
}

impl RunnerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<RunnerHandle>) {
        self.by_symbol
            .write()
            .unwrap()
            .entry(handle.symbol.clone())
            .or_default()
            .insert(handle.uuid, handle.clone());
        self.by_uuid.insert(handle.uuid, handle);
    }

    pub fn remove(&self, symbol: &str, uuid: Uuid) {
        let mut by_symbol = self.by_symbol.write().unwrap();
        if let Some(runners) = by_symbol.get_mut(symbol) {
            runners.remove(&uuid);
            if runners.is_empty() {
                by_symbol.remove(symbol);
            }
        }
        drop(by_symbol);
        self.by_uuid.remove(&uuid);
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<RunnerHandle>> {
        self.by_uuid.get(&uuid).map(|e| e.value().clone())
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.by_uuid.contains_key(&uuid)
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    /// Fan a mark out to every listening runner of the symbol. Sends
    /// never block: a busy or stopping runner just misses the sample.
    pub fn broadcast(&self, symbol: &str, mark: Mark) {
        let by_symbol = self.by_symbol.read().unwrap();
        if let Some(runners) = by_symbol.get(symbol) {
            for handle in runners.values() {
                handle.try_send_mark(mark);
            }
        }
    }

    pub fn all_handles(&self) -> Vec<Arc<RunnerHandle>> {
        self.by_uuid.iter().map(|e| e.value().clone()).collect()
    }

    /// uuid → (symbol, last price check) snapshot for the admin
    /// surface.
    pub fn list(&self) -> HashMap<Uuid, (String, Option<DateTime<Utc>>)> {
        self.by_uuid
            .iter()
            .map(|e| {
                let h = e.value();
                (h.uuid, (h.symbol.clone(), h.last_checked()))
            })
            .collect()
    }
}

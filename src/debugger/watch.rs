//! Watch expression list.
//!
//! Watches are re-evaluated after every stop, in insertion order. A failed
//! evaluation records its error and never halts the batch.

use crate::debugger::error::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

pub type WatchId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watch {
    pub id: WatchId,
    pub expression: String,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
}

impl Watch {
    fn blank(&self) -> Watch {
        Watch {
            id: self.id,
            expression: self.expression.clone(),
            last_result: None,
            last_error: None,
        }
    }
}

#[derive(Default)]
pub struct WatchRegistry {
    watches: Mutex<IndexMap<WatchId, Watch>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, expression: &str) -> Watch {
        let watch = Watch {
            id: Uuid::new_v4(),
            expression: expression.to_string(),
            last_result: None,
            last_error: None,
        };
        self.watches.lock().unwrap().insert(watch.id, watch.clone());
        watch
    }

    pub fn remove(&self, id: WatchId) -> Result<Watch, Error> {
        self.watches
            .lock()
            .unwrap()
            .shift_remove(&id)
            .ok_or(Error::WatchNotFound(id))
    }

    pub fn all(&self) -> Vec<Watch> {
        self.watches.lock().unwrap().values().cloned().collect()
    }

    /// The list as the UI must see it when nothing is stopped: expressions
    /// only, results blanked.
    pub fn all_blank(&self) -> Vec<Watch> {
        self.watches.lock().unwrap().values().map(Watch::blank).collect()
    }

    /// Expressions to evaluate on the next refresh cycle, insertion order.
    pub fn expressions(&self) -> Vec<(WatchId, String)> {
        self.watches
            .lock()
            .unwrap()
            .values()
            .map(|w| (w.id, w.expression.clone()))
            .collect()
    }

    pub fn record(&self, id: WatchId, outcome: Result<String, String>) {
        let mut watches = self.watches.lock().unwrap();
        let Some(watch) = watches.get_mut(&id) else { return };
        match outcome {
            Ok(result) => {
                watch.last_result = Some(result);
                watch.last_error = None;
            }
            Err(error) => {
                watch.last_result = None;
                watch.last_error = Some(error);
            }
        }
    }

    pub fn clear_results(&self) {
        for watch in self.watches.lock().unwrap().values_mut() {
            watch.last_result = None;
            watch.last_error = None;
        }
    }
}

//! Registry of running turns, keyed by message id.
//!
//! A stop request arrives out of band with only a message id; this is where
//! it finds the context to stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::RequestContext;

#[derive(Clone, Default)]
pub struct LiveContexts {
    contexts: Arc<Mutex<HashMap<String, Arc<RequestContext>>>>,
}

impl LiveContexts {
    pub fn insert(&self, message_id: &str, context: Arc<RequestContext>) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.to_string(), context);
    }

    pub fn get(&self, message_id: &str) -> Option<Arc<RequestContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_id)
            .cloned()
    }

    /// Remove the entry for `message_id` if it still belongs to `context`.
    ///
    /// A regenerated message can re-register under the same id; the older
    /// context must not evict the newer one.
    pub fn remove(&self, message_id: &str, context: &RequestContext) {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if contexts
            .get(message_id)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), context))
        {
            contexts.remove(message_id);
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

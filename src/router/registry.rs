//! Transport lookup by kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::transport::Transport;
use crate::types::TransportKind;

/// Registered transports, one per kind.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its own kind, replacing any previous one.
    pub fn register(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    /// Transport for `kind`, if registered.
    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.transports.get(&kind).cloned()
    }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<TransportKind> {
        TransportKind::ALL
            .into_iter()
            .filter(|k| self.transports.contains_key(k))
            .collect()
    }
}

//! Carrier tracking adapters.
//!
//! Each carrier API is an external collaborator behind
//! `CarrierTrackingSource`; the registry maps a detected carrier to its
//! adapter. Adapters are constructed once at startup and injected — no
//! module-level singletons.

use crate::model::Carrier;
use crate::source::CarrierTrackingSource;
use std::collections::HashMap;
use std::sync::Arc;

pub mod ups;

pub use ups::UpsClient;

/// Registry of available carrier adapters.
#[derive(Clone, Default)]
pub struct CarrierRegistry {
    sources: HashMap<Carrier, Arc<dyn CarrierTrackingSource>>,
}

impl CarrierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn CarrierTrackingSource>) {
        self.sources.insert(source.carrier(), source);
    }

    pub fn get(&self, carrier: Carrier) -> Option<Arc<dyn CarrierTrackingSource>> {
        self.sources.get(&carrier).cloned()
    }

    pub fn carriers(&self) -> Vec<Carrier> {
        self.sources.keys().copied().collect()
    }
}

use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::{Provider, RuntimeContext};

pub trait ProviderLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Provider>>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under `provider.name()`, returning any provider it replaced.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        self.register_as(provider.name().to_string(), provider)
    }

    pub fn register_as(
        &mut self,
        name: String,
        provider: Arc<dyn Provider>,
    ) -> Option<Arc<dyn Provider>> {
        debug!(event = "provider.registry.registered", provider = %name);
        self.providers.insert(name, provider)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Binds `runtime` into every provider that accepts one; returns how many did.
    pub fn bind_runtime(&self, runtime: &RuntimeContext) -> usize {
        self.providers
            .values()
            .filter_map(|provider| provider.runtime_settings())
            .map(|aware| aware.bind_runtime(runtime.clone()))
            .count()
    }
}

impl ProviderLookup for ProviderRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.get(name)
    }
}

use std::sync::Arc;

use tracing::debug;

use crate::pipeline::module::ProcessingModule;
use crate::pipeline::modules::{Saturation, Velvia};

/// The set of modules known to a session, keyed by their stable `op`.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Vec<Arc<dyn ProcessingModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_modules() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Velvia));
        registry.register(Arc::new(Saturation));
        registry
    }

    /// Add a module. A module with the same `op` is replaced.
    pub fn register(&mut self, module: Arc<dyn ProcessingModule>) {
        let op = module.name().to_string();
        if let Some(slot) = self.modules.iter_mut().find(|m| m.name() == op) {
            debug!(module = %op, "replacing registered module");
            *slot = module;
        } else {
            debug!(module = %op, "registered module");
            self.modules.push(module);
        }
    }

    /// Look up by `op`. Aliases are display names only and are not resolved here.
    pub fn get(&self, op: &str) -> Option<&Arc<dyn ProcessingModule>> {
        self.modules.iter().find(|m| m.name() == op)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProcessingModule>> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

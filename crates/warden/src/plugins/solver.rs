use std::collections::{BTreeMap, BTreeSet};

/// Orders plugins so that every plugin runs after the plugins it depends on.
#[derive(Debug, Default, Clone)]
pub struct DependencySolver {
    // plugin -> plugins it depends on
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencySolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&mut self, name: &str) -> bool {
        if self.deps.contains_key(name) {
            log::error!("plugin {name} already added to the dependency solver");
            return false;
        }
        self.deps.insert(name.to_string(), BTreeSet::new());
        true
    }

    pub fn add_dependency(&mut self, plugin: &str, depends_on: &str) -> bool {
        if !self.deps.contains_key(depends_on) {
            log::error!("plugin {plugin} depends on unknown plugin {depends_on}");
            return false;
        }
        match self.deps.get_mut(plugin) {
            Some(deps) => {
                deps.insert(depends_on.to_string());
                true
            }
            None => {
                log::error!("unknown plugin {plugin}");
                false
            }
        }
    }

    /// Dependencies first; empty if the graph has a cycle.
    pub fn order(&self) -> Vec<String> {
        let mut pending: BTreeMap<&str, usize> = self
            .deps
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(next) = ready.pop_first() {
            pending.remove(next);
            order.push(next.to_string());
            for (name, deps) in &self.deps {
                if deps.contains(next) {
                    if let Some(n) = pending.get_mut(name.as_str()) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(name.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != self.deps.len() {
            log::error!("cyclic plugin dependencies among {:?}", pending.keys());
            return vec![];
        }
        order
    }

    pub fn reversed_order(&self) -> Vec<String> {
        let mut order = self.order();
        order.reverse();
        order
    }
}

//! Layered environment variables.
//!
//! Pipeline env is overridden by job env, which is overridden by step env.
//! The layers are carried explicitly from the definition down to the step
//! runner; nothing here touches the process environment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvLayers {
    layers: Vec<BTreeMap<String, String>>,
}

impl EnvLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a layer on top; its keys override every earlier layer.
    pub fn with_layer<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.layers.push(
            vars.into_iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut layer = BTreeMap::new();
        layer.insert(key.into(), value.into());
        self.layers.push(layer);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.layers
            .iter()
            .rev()
            .find_map(|layer| layer.get(key).map(String::as_str))
    }

    /// Flatten all layers, later layers winning.
    pub fn resolve(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for layer in &self.layers {
            for (k, v) in layer {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }
}

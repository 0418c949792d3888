// SPDX-License-Identifier: MPL-2.0

//! Element factory availability cache
//!
//! Probing the engine's plugin registry is slow, so results are cached per
//! element name. The cache is an explicit object: construct one per process
//! with the engine's probe and hand it to whichever engine needs lookups.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

type Probe = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct ElementFactoryCache {
    probe: Probe,
    known: Mutex<HashMap<String, bool>>,
}

impl ElementFactoryCache {
    /// Cache answering lookups with `probe`
    pub fn new<F>(probe: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            probe: Box::new(probe),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Cache that reports only `names` as available
    pub fn with_available(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        Self::new(move |name| names.iter().any(|n| n == name))
    }

    /// Cache that reports every element as available
    pub fn permissive() -> Self {
        Self::new(|_| true)
    }

    pub fn is_available(&self, name: &str) -> bool {
        let mut known = self.known.lock();
        if let Some(available) = known.get(name) {
            return *available;
        }
        let available = (self.probe)(name);
        debug!(element = name, available, "Probed element factory");
        known.insert(name.to_string(), available);
        available
    }

    /// First available element out of `candidates`, in order
    pub fn first_available<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|name| self.is_available(name))
    }

    /// `preferred` if available, otherwise the first available fallback
    pub fn select(&self, preferred: Option<&str>, fallbacks: &[&str]) -> Option<String> {
        if let Some(name) = preferred {
            return self.is_available(name).then(|| name.to_string());
        }
        self.first_available(fallbacks).map(str::to_string)
    }

    /// Forget cached answers, e.g. after the plugin registry was rescanned
    pub fn clear(&self) {
        self.known.lock().clear();
    }
}

impl fmt::Debug for ElementFactoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementFactoryCache")
            .field("cached", &self.known.lock().len())
            .finish()
    }
}

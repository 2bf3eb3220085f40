//! Queue -> processor wiring

use cairn_core::port::JobProcessor;
use std::collections::HashMap;
use std::sync::Arc;

/// Processors by queue name. Queues without one get no workers.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, queue: impl Into<String>, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(queue.into(), processor);
        self
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(queue).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Configured queues that have no processor
    pub fn missing<'a>(&self, queues: &'a [String]) -> Vec<&'a str> {
        queues
            .iter()
            .filter(|q| !self.processors.contains_key(q.as_str()))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::port::job_processor::mocks::{MockBehavior, MockProcessor};

    #[test]
    fn test_lookup_and_missing() {
        let registry = ProcessorRegistry::new().register(
            "note-processing",
            Arc::new(MockProcessor::new(MockBehavior::Success)),
        );
        assert!(!registry.is_empty());
        assert!(registry.get("note-processing").is_some());
        assert!(registry.get("photo-processing").is_none());

        let queues = vec!["note-processing".to_string(), "photo-processing".to_string()];
        assert_eq!(registry.missing(&queues), vec!["photo-processing"]);
    }
}

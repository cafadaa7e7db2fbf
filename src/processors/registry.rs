//! Processor registry — closed map from intent to capability.
//!
//! Registration happens once at startup with compile-time-checked processor
//! types; resolution is a plain map lookup with a default fallback, so
//! there is no runtime construction or reflection-style dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::intent::DEFAULT_INTENT;
use crate::processors::{DefaultProcessor, Processor};

pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
    default: Arc<dyn Processor>,
}

impl ProcessorRegistry {
    /// Create a registry whose fallback is the built-in default processor.
    pub fn new() -> Self {
        Self::with_default(Arc::new(DefaultProcessor::new()))
    }

    /// Create a registry with a custom fallback processor.
    pub fn with_default(default: Arc<dyn Processor>) -> Self {
        let mut processors: HashMap<String, Arc<dyn Processor>> = HashMap::new();
        processors.insert(DEFAULT_INTENT.to_string(), Arc::clone(&default));
        Self {
            processors,
            default,
        }
    }

    /// Register a processor under its declared intent. Replaces any earlier
    /// registration for the same intent.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let intent = processor.intent().to_string();
        if self.processors.insert(intent.clone(), processor).is_some() {
            warn!(intent = %intent, "Replacing previously registered processor");
        } else {
            debug!(intent = %intent, "Registered processor");
        }
    }

    /// Resolve an intent to a processor, falling back to the default when
    /// no exact match exists.
    pub fn resolve(&self, intent: Option<&str>) -> Arc<dyn Processor> {
        match intent.and_then(|i| self.processors.get(i)) {
            Some(processor) => Arc::clone(processor),
            None => Arc::clone(&self.default),
        }
    }

    pub fn count(&self) -> usize {
        self.processors.len()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{ExecutionContext, ProcessorError, ProcessorOutput};
    use async_trait::async_trait;

    struct FixedProcessor {
        intent: &'static str,
    }

    #[async_trait]
    impl Processor for FixedProcessor {
        fn intent(&self) -> &str {
            self.intent
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
        ) -> Result<ProcessorOutput, ProcessorError> {
            Ok(ProcessorOutput::text("ok"))
        }
    }

    #[test]
    fn resolves_exact_match() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(FixedProcessor {
            intent: "content_generation",
        }));

        let resolved = registry.resolve(Some("content_generation"));
        assert_eq!(resolved.intent(), "content_generation");
    }

    #[test]
    fn unknown_intent_falls_back_to_default() {
        let registry = ProcessorRegistry::new();
        let resolved = registry.resolve(Some("no_such_intent"));
        assert_eq!(resolved.intent(), DEFAULT_INTENT);
    }

    #[test]
    fn missing_intent_falls_back_to_default() {
        let registry = ProcessorRegistry::new();
        let resolved = registry.resolve(None);
        assert_eq!(resolved.intent(), DEFAULT_INTENT);
    }

    #[test]
    fn re_registration_replaces() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(FixedProcessor { intent: "analytics" }));
        registry.register(Arc::new(FixedProcessor { intent: "analytics" }));
        // Default + one analytics entry.
        assert_eq!(registry.count(), 2);
    }
}

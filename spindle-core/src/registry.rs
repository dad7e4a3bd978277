//! Workflow registry.
//!
//! The driver looks workflow implementations up by type name; the
//! registry is the explicit collaborator holding that mapping. It is
//! code, not data: it contains closures and cannot be serialized, so
//! every process that replays a workflow must build the same registry
//! from the same registration calls.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::codec::{Codec, sealed};
use crate::context::WorkflowContext;
use crate::workflow::{UntypedWorkflow, Workflow, workflow_fn};

/// Registry mapping workflow type names to implementations.
pub struct WorkflowRegistry {
    workflows: HashMap<String, UntypedWorkflow>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    /// Register a workflow from a typed closure.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// registry.register("double", codec.clone(), |_ctx, input: u32| Ok(input * 2));
    /// ```
    pub fn register<I, O, F, C>(&mut self, name: &str, codec: Arc<C>, func: F)
    where
        F: Fn(&WorkflowContext, I) -> Result<O> + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
        C: Codec + sealed::DecodeValue<I> + sealed::EncodeValue<O>,
    {
        self.workflows
            .insert(name.to_string(), workflow_fn(codec, func));
    }

    /// Register a workflow trait object directly.
    pub fn register_workflow<W>(&mut self, name: &str, workflow: W)
    where
        W: Workflow + 'static,
    {
        self.workflows.insert(name.to_string(), Arc::new(workflow));
    }

    /// Get a workflow by type name.
    pub fn get(&self, name: &str) -> Option<UntypedWorkflow> {
        self.workflows.get(name).map(Arc::clone)
    }

    /// Check if a workflow type name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Number of registered workflows.
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Iterator over registered workflow type names.
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }

    /// Create a builder with a shared codec for ergonomic registration.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let registry = WorkflowRegistry::with_codec(codec)
    ///     .register("double", |_ctx, i: u32| Ok(i * 2))
    ///     .register("add_ten", |_ctx, i: u32| Ok(i + 10))
    ///     .build();
    /// ```
    pub fn with_codec<C>(codec: Arc<C>) -> RegistryBuilder<C>
    where
        C: Codec,
    {
        RegistryBuilder {
            codec,
            registry: WorkflowRegistry::new(),
        }
    }
}

/// Builder for registration with a shared codec, created via
/// [`WorkflowRegistry::with_codec`]. The codec is held internally so
/// each registration doesn't need its own `codec.clone()`.
pub struct RegistryBuilder<C> {
    codec: Arc<C>,
    registry: WorkflowRegistry,
}

impl<C: Codec> RegistryBuilder<C> {
    /// Register a workflow from a typed closure.
    #[must_use]
    pub fn register<I, O, F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&WorkflowContext, I) -> Result<O> + Send + Sync + 'static,
        I: Send + 'static,
        O: Send + 'static,
        C: sealed::DecodeValue<I> + sealed::EncodeValue<O>,
    {
        self.registry.register(name, Arc::clone(&self.codec), func);
        self
    }

    /// Register a workflow trait object directly.
    #[must_use]
    pub fn register_workflow<W>(mut self, name: &str, workflow: W) -> Self
    where
        W: Workflow + 'static,
    {
        self.registry.register_workflow(name, workflow);
        self
    }

    /// Finish building and return the registry.
    pub fn build(self) -> WorkflowRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoder, Encoder};
    use bytes::Bytes;

    struct DummyCodec;
    impl Encoder for DummyCodec {}
    impl Decoder for DummyCodec {}
    impl sealed::EncodeValue<u32> for DummyCodec {
        fn encode_value(&self, _: &u32) -> Result<Bytes> {
            Ok(Bytes::from_static(b"encoded"))
        }
    }
    impl sealed::DecodeValue<u32> for DummyCodec {
        fn decode_value(&self, _: Bytes) -> Result<u32> {
            Ok(42)
        }
    }

    #[test]
    fn register_and_look_up() {
        let mut registry = WorkflowRegistry::new();
        let codec = Arc::new(DummyCodec);

        registry.register("double", codec, |_ctx, input: u32| Ok(input * 2));

        assert!(registry.contains("double"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("double").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn builder_shares_one_codec() {
        let registry = WorkflowRegistry::with_codec(Arc::new(DummyCodec))
            .register("a", |_ctx, i: u32| Ok(i))
            .register("b", |_ctx, i: u32| Ok(i + 1))
            .build();

        let mut names: Vec<_> = registry.workflow_names().collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn registered_closure_runs_through_the_codec() {
        let mut registry = WorkflowRegistry::new();
        registry.register("double", Arc::new(DummyCodec), |_ctx, input: u32| {
            Ok(input * 2)
        });

        let workflow = registry.get("double").unwrap();
        let ctx = WorkflowContext::background();
        let output = workflow.execute(&ctx, Bytes::from_static(b"ignored")).unwrap();
        // DummyCodec decodes everything to 42 and encodes everything to
        // the same marker.
        assert_eq!(output, Bytes::from_static(b"encoded"));
    }
}

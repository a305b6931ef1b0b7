//! The operation invocation pipeline.
//!
//! Every remote call flows through a fixed composition of decorators
//! around a protocol-specific invoker: the policy decorator masks
//! emitted values per the active rule sets, the cache decorator gives
//! "exactly one writer, many readers" semantics per invocation key,
//! and base dispatch selects the protocol invoker registered for the
//! service's transport. The pipeline is built once from configuration;
//! ordering is explicit and each stage is testable in isolation.

pub mod cache;
pub mod lineage;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::cancel::CancellationFlag;
use crate::descriptor::{Operation, Service};
use crate::error::InvocationError;
use crate::instance::TypedInstance;
use crate::schema::ActiveSchema;

use cache::{CacheDecorator, CacheStore};
use lineage::LineageSink;
use policy::PolicyDecorator;

/// A push-based stream of typed values emitted by one invocation.
pub type InstanceStream = BoxStream<'static, Result<TypedInstance, InvocationError>>;

/// A concrete argument bound to a named operation parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    /// The parameter name.
    pub name: String,
    /// The bound value.
    pub value: TypedInstance,
}

impl BoundParameter {
    /// Binds a value to a parameter name.
    pub fn new(name: impl Into<String>, value: TypedInstance) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A protocol-specific operation invoker. One implementation exists
/// per transport; all are external collaborators to the core.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Invokes the operation with the bound parameters, returning an
    /// asynchronous stream of emitted values.
    async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        params: &[BoundParameter],
    ) -> Result<InstanceStream, InvocationError>;
}

/// Everything an invocation needs from the surrounding query.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// The query on whose behalf the invocation runs.
    pub query_id: Uuid,
    /// The query's cancellation signal.
    pub cancel: CancellationFlag,
    /// Caller-scoped facts, used to resolve policy subjects.
    pub caller_facts: Vec<TypedInstance>,
}

/// The statically composed invocation pipeline:
/// policy decorator → cache decorator → transport dispatch.
pub struct InvocationPipeline {
    invokers: HashMap<String, Arc<dyn OperationInvoker>>,
    cache: CacheDecorator,
    policy: PolicyDecorator,
}

impl InvocationPipeline {
    /// Builds the pipeline from configuration. `rule_sets` normally
    /// come from the schema snapshot's policy declarations.
    #[must_use]
    pub fn new(
        invokers: HashMap<String, Arc<dyn OperationInvoker>>,
        cache_store: Arc<dyn CacheStore>,
        lineage: Arc<dyn LineageSink>,
        policy: PolicyDecorator,
    ) -> Self {
        Self {
            invokers,
            cache: CacheDecorator::new(cache_store, lineage),
            policy,
        }
    }

    /// Overrides the cache lock lease TTL.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.cache = self.cache.with_lease_ttl(ttl);
        self
    }

    /// Invokes an operation through the full decorator chain.
    ///
    /// The returned stream has already been cache-routed (this caller
    /// may be the writer or a replaying reader) and every item it
    /// yields has passed policy masking.
    pub async fn invoke(
        &self,
        schema: &ActiveSchema,
        service: &Service,
        operation: &Operation,
        params: &[BoundParameter],
        ctx: &InvocationContext,
    ) -> Result<InstanceStream, InvocationError> {
        let invoker = self
            .invokers
            .get(&service.transport)
            .ok_or_else(|| InvocationError::NoInvoker {
                transport: service.transport.clone(),
            })?;

        let cached = self
            .cache
            .invoke(
                service,
                operation,
                params,
                ctx.query_id,
                ctx.cancel.clone(),
                Arc::clone(invoker),
            )
            .await?;

        Ok(self
            .policy
            .apply(schema, operation, ctx.caller_facts.clone(), cached))
    }
}

//! The query engine: the crate's entry point for submitting queries.
//!
//! `submit` binds the query's `given {}` parameters, layers any
//! inline types over the schema snapshot, and resolves the target
//! through the discovery chain. Single-result queries abort on the
//! first fatal error; gather-many queries emit what resolved and
//! close with a summary of what did not.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::cancel::CancellationFlag;
use crate::error::{MeshError, MeshResult};
use crate::facts::FactBag;
use crate::instance::{Scalar, TypedInstance};
use crate::invoke::InvocationPipeline;
use crate::query::strategy::Resolver;
use crate::query::{bind_given, Projection, QueryContext, QueryMode, QuerySpec};
use crate::schema::{ActiveSchema, Schema};

/// One element of a query's result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryStreamEvent {
    /// A resolved result value.
    Item(TypedInstance),
    /// The closing summary. Always the final event.
    Summary(QuerySummary),
}

/// What a query produced and what it could not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySummary {
    /// Number of result items emitted.
    pub resolved: usize,
    /// Descriptions of targets that could not be resolved. Empty for
    /// a fully successful query.
    pub unresolved: Vec<String>,
}

/// The query's asynchronous result stream.
pub type QueryStream = BoxStream<'static, QueryStreamEvent>;

/// Resolves submitted queries against a schema snapshot through an
/// invocation pipeline.
pub struct QueryEngine {
    schema: Arc<Schema>,
    resolver: Resolver,
}

impl QueryEngine {
    /// Creates an engine over a schema snapshot and pipeline.
    #[must_use]
    pub fn new(schema: Arc<Schema>, pipeline: Arc<InvocationPipeline>) -> Self {
        Self {
            schema,
            resolver: Resolver::new(pipeline),
        }
    }

    /// Submits a query.
    ///
    /// `facts` seeds the query's fact bag; `arguments` bind the
    /// `given {}` parameters (schema constants fill the gaps); the
    /// cancellation flag reaches every invocation and cache
    /// subscription spawned on the query's behalf.
    ///
    /// A single-result query returns an error on the first fatal
    /// failure. A gather-many query returns a stream of partial
    /// results followed by a summary of unresolved items.
    pub async fn submit(
        &self,
        spec: QuerySpec,
        facts: FactBag,
        arguments: HashMap<String, Scalar>,
        cancel: CancellationFlag,
    ) -> MeshResult<QueryStream> {
        let schema = if spec.inline_types.is_empty() {
            ActiveSchema::new(Arc::clone(&self.schema))
        } else {
            ActiveSchema::with_inline_types(Arc::clone(&self.schema), spec.inline_types.clone())
        };

        // Raised before any remote call is attempted.
        let bindings = bind_given(&spec.given, &arguments, &schema)?;

        let mut ctx = QueryContext::new(schema, facts, spec.fact_sets.clone())
            .with_bindings(bindings);
        ctx.cancel = cancel;

        match spec.mode {
            QueryMode::Single => self.run_single(&spec, &mut ctx).await,
            QueryMode::Gather => Ok(self.run_gather(&spec, &mut ctx).await),
        }
    }

    async fn run_single(
        &self,
        spec: &QuerySpec,
        ctx: &mut QueryContext,
    ) -> MeshResult<QueryStream> {
        let resolved = self
            .resolver
            .resolve(&spec.target, &spec.constraints, ctx)
            .await?;
        let item = match &spec.projection {
            Some(projection) => self.project(&resolved, projection, ctx).await?,
            None => resolved,
        };
        let events = vec![
            QueryStreamEvent::Item(item),
            QueryStreamEvent::Summary(QuerySummary {
                resolved: 1,
                unresolved: Vec::new(),
            }),
        ];
        Ok(futures::stream::iter(events).boxed())
    }

    async fn run_gather(&self, spec: &QuerySpec, ctx: &mut QueryContext) -> QueryStream {
        let mut summary = QuerySummary::default();
        let mut events = Vec::new();

        match self
            .resolver
            .resolve(&spec.target, &spec.constraints, ctx)
            .await
        {
            Ok(resolved) => {
                let items = match resolved.as_collection() {
                    Some(items) => items.to_vec(),
                    None => vec![resolved],
                };
                for item in items {
                    match &spec.projection {
                        Some(projection) => {
                            match self.project(&item, projection, ctx).await {
                                Ok(projected) => {
                                    events.push(QueryStreamEvent::Item(projected));
                                }
                                Err(err) => {
                                    // Item-level failures omit the item
                                    // and continue with the rest.
                                    debug!(error = %err, "projection branch failed");
                                    summary.unresolved.push(err.to_string());
                                }
                            }
                        }
                        None => events.push(QueryStreamEvent::Item(item)),
                    }
                }
            }
            Err(err) => summary.unresolved.push(err.to_string()),
        }

        summary.resolved = events.len();
        events.push(QueryStreamEvent::Summary(summary));
        futures::stream::iter(events).boxed()
    }

    /// Assembles a projected object: each requested field resolves
    /// through the strategy chain with the source value and its
    /// attributes in scope. Independent fields run concurrently on
    /// isolated context branches.
    async fn project(
        &self,
        source: &TypedInstance,
        projection: &Projection,
        ctx: &QueryContext,
    ) -> MeshResult<TypedInstance> {
        let field_futures = projection.fields.iter().map(|(name, field_type)| {
            let mut branch = ctx.branch();
            branch.facts.add_default(source.clone());
            for (_, attribute) in source.attributes() {
                branch.facts.add_default(attribute.clone());
            }
            async move {
                let value = self.resolver.resolve(field_type, &[], &mut branch).await?;
                Ok::<_, MeshError>((name.clone(), value))
            }
        });

        let attributes = futures::future::try_join_all(field_futures).await?;
        Ok(TypedInstance::object(
            projection.type_name.clone(),
            attributes,
            source.provenance.clone(),
        ))
    }
}

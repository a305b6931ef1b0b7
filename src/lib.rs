//! # MeshQL - Federated Data-Query Engine
//!
//! MeshQL resolves requests for semantic data types across a mesh of
//! remote services described by a shared schema. Given a target type,
//! optional constraints, and an output projection, it determines how
//! to produce the data - from values already known, from derived
//! attributes, or by invoking remote operations - while avoiding
//! redundant remote calls and enforcing data-access policies on what
//! is returned.
//!
//! ## Core Concepts
//!
//! - **Fact / FactBag**: a known typed value available to resolution,
//!   and the multimap holding all such values, partitioned by fact set
//! - **TypedInstance**: a value tagged with its schema type and the
//!   provenance recording where it came from
//! - **Discovery Strategy Chain**: known-fact scan, derived
//!   expression, direct constrained invocation, generic query fallback
//! - **Invocation Pipeline**: policy masking over result caching over
//!   protocol dispatch, composed once from configuration
//! - **Result Cache**: one writer, many readers per invocation key
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshql::{
//!     CancellationFlag, FactBag, InvocationPipeline, PolicyDecorator,
//!     QueryEngine, QuerySpec,
//! };
//! use meshql::invoke::cache::InMemoryCacheStore;
//! use meshql::invoke::lineage::NoopLineageSink;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let pipeline = Arc::new(InvocationPipeline::new(
//!     invokers,
//!     Arc::new(InMemoryCacheStore::new()),
//!     Arc::new(NoopLineageSink),
//!     PolicyDecorator::new(schema.rule_sets().to_vec()),
//! ));
//! let engine = QueryEngine::new(schema, pipeline);
//!
//! let stream = engine
//!     .submit(
//!         QuerySpec::gather("orders.Orders"),
//!         FactBag::new(),
//!         HashMap::new(),
//!         CancellationFlag::new(),
//!     )
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core data model
pub mod cancel;
pub mod descriptor;
pub mod error;
pub mod facts;
pub mod instance;
pub mod schema;

// Resolution and invocation
pub mod invoke;
pub mod query;

// Re-export primary types at crate root for convenience
pub use cancel::CancellationFlag;
pub use descriptor::{
    Constraint, ConstraintOperator, Operation, OperationMetadata, Parameter, Service, ValueExpr,
};
pub use error::{InvocationError, MeshError, MeshResult, ResolutionError};
pub use facts::{FactBag, FactSetId};
pub use instance::{InstanceValue, Provenance, Scalar, TypedInstance};
pub use invoke::policy::{
    Condition, ExecutionScope, Instruction, PolicyDecorator, PolicyOperator, PolicyStatement,
    RuleSet, Subject,
};
pub use invoke::{
    BoundParameter, InstanceStream, InvocationContext, InvocationPipeline, OperationInvoker,
};
pub use query::engine::{QueryEngine, QueryStream, QueryStreamEvent, QuerySummary};
pub use query::{Projection, QueryContext, QueryMode, QuerySpec};
pub use schema::{ActiveSchema, QualifiedName, Schema, SchemaBuilder, TypeDef, TypeKind};

//! Query assembly: the request shape and per-query execution state.
//!
//! A [`QuerySpec`] names the target type, the constraints its values
//! must satisfy, an optional output projection, and the `given {}`
//! parameters the query references. Before any remote call, every
//! referenced parameter is bound from the caller's arguments or a
//! schema-declared constant; an unbindable parameter is a hard
//! configuration error.
//!
//! A [`QueryContext`] carries everything one execution needs: the
//! active schema (snapshot plus inline types), the fact bag, the
//! resolution stack for cycle detection, the set of operations that
//! already failed this query, and the cancellation flag. It lives for
//! exactly one query and is discarded at completion.

pub mod engine;
pub mod strategy;

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::cancel::CancellationFlag;
use crate::descriptor::Constraint;
use crate::error::ResolutionError;
use crate::facts::{FactBag, FactSetId};
use crate::instance::{Scalar, TypedInstance};
use crate::schema::{ActiveSchema, QualifiedName, TypeDef};

/// Whether the query wants a single value or gathers many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Exactly one result; the first fatal error aborts the query.
    Single,
    /// Many results; unresolved items are omitted and summarized.
    Gather,
}

/// A requested output shape: an object type assembled field-by-field,
/// each field resolved through the discovery chain with the source
/// value's attributes in scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// The projected type name.
    pub type_name: QualifiedName,
    /// Field name to field type, in output order.
    pub fields: Vec<(String, QualifiedName)>,
}

impl Projection {
    /// Creates a projection.
    pub fn new(
        type_name: impl Into<QualifiedName>,
        fields: Vec<(String, QualifiedName)>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }
}

/// One query request.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// The requested type.
    pub target: QualifiedName,
    /// Constraints values of the target must satisfy.
    pub constraints: Vec<Constraint>,
    /// Single or gather-many semantics.
    pub mode: QueryMode,
    /// Optional output projection.
    pub projection: Option<Projection>,
    /// Parameter names referenced by the query's `given {}` clause.
    pub given: Vec<String>,
    /// The fact sets this query is entitled to see.
    pub fact_sets: Vec<FactSetId>,
    /// Types declared only within this query, layered over the schema
    /// snapshot for the query's duration.
    pub inline_types: Vec<TypeDef>,
}

impl QuerySpec {
    /// A single-result query for the target type.
    pub fn single(target: impl Into<QualifiedName>) -> Self {
        Self {
            target: target.into(),
            constraints: Vec::new(),
            mode: QueryMode::Single,
            projection: None,
            given: Vec::new(),
            fact_sets: vec![FactSetId::All],
            inline_types: Vec::new(),
        }
    }

    /// A gather-many query for the target type.
    pub fn gather(target: impl Into<QualifiedName>) -> Self {
        Self {
            mode: QueryMode::Gather,
            ..Self::single(target)
        }
    }

    /// Adds a constraint.
    #[must_use]
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Sets the output projection.
    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// References a `given {}` parameter.
    #[must_use]
    pub fn with_given(mut self, parameter: impl Into<String>) -> Self {
        self.given.push(parameter.into());
        self
    }

    /// Restricts the visible fact sets.
    #[must_use]
    pub fn with_fact_sets(mut self, sets: Vec<FactSetId>) -> Self {
        self.fact_sets = sets;
        self
    }

    /// Declares a query-local type.
    #[must_use]
    pub fn with_inline_type(mut self, def: TypeDef) -> Self {
        self.inline_types.push(def);
        self
    }
}

/// Binds every `given {}` parameter from caller arguments first, then
/// schema constants. Raised before any remote call is attempted.
pub fn bind_given(
    given: &[String],
    arguments: &HashMap<String, Scalar>,
    schema: &ActiveSchema,
) -> Result<HashMap<String, Scalar>, ResolutionError> {
    let mut bindings = HashMap::new();
    for parameter in given {
        let value = arguments
            .get(parameter)
            .or_else(|| schema.constant(parameter))
            .cloned()
            .ok_or_else(|| ResolutionError::MissingGivenBinding {
                parameter: parameter.clone(),
            })?;
        bindings.insert(parameter.clone(), value);
    }
    Ok(bindings)
}

/// Per-query execution state threaded through the strategy chain.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// The query's id.
    pub query_id: Uuid,
    /// The schema active for this query.
    pub schema: ActiveSchema,
    /// The facts known to this query.
    pub facts: FactBag,
    /// The fact sets visible to resolution.
    pub fact_sets: Vec<FactSetId>,
    /// Bound `given {}` parameters.
    pub bindings: HashMap<String, Scalar>,
    /// The query's cancellation signal.
    pub cancel: CancellationFlag,
    resolution_stack: Vec<QualifiedName>,
    failed_operations: HashSet<String>,
}

impl QueryContext {
    /// Creates a context for one query execution.
    #[must_use]
    pub fn new(schema: ActiveSchema, facts: FactBag, fact_sets: Vec<FactSetId>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            schema,
            facts,
            fact_sets,
            bindings: HashMap::new(),
            cancel: CancellationFlag::new(),
            resolution_stack: Vec::new(),
            failed_operations: HashSet::new(),
        }
    }

    /// Sets the bound `given {}` parameters.
    #[must_use]
    pub fn with_bindings(mut self, bindings: HashMap<String, Scalar>) -> Self {
        self.bindings = bindings;
        self
    }

    /// Pushes a type onto the resolution stack, rejecting re-entry.
    ///
    /// Alias-equivalent re-entry counts as a cycle: resolving `t.A`
    /// while `t.AAlias` is already on the stack would loop forever.
    pub fn enter(&mut self, target: &QualifiedName) -> Result<(), ResolutionError> {
        let base = self.schema.base_type(target);
        if self
            .resolution_stack
            .iter()
            .any(|t| self.schema.base_type(t) == base)
        {
            let mut chain: Vec<String> = self
                .resolution_stack
                .iter()
                .map(ToString::to_string)
                .collect();
            chain.push(target.to_string());
            return Err(ResolutionError::Cycle {
                type_name: target.to_string(),
                chain,
            });
        }
        self.resolution_stack.push(target.clone());
        Ok(())
    }

    /// Pops the most recent resolution frame.
    pub fn leave(&mut self) {
        self.resolution_stack.pop();
    }

    /// Records an operation whose invocation failed this query.
    /// It will not be retried within the same execution.
    pub fn exclude_operation(&mut self, qualified_name: impl Into<String>) {
        self.failed_operations.insert(qualified_name.into());
    }

    /// Returns true when the operation already failed this query.
    #[must_use]
    pub fn is_excluded(&self, qualified_name: &str) -> bool {
        self.failed_operations.contains(qualified_name)
    }

    /// Caller-scoped facts, used to resolve policy subjects.
    #[must_use]
    pub fn caller_facts(&self) -> Vec<TypedInstance> {
        self.facts
            .facts_for(&[FactSetId::Caller])
            .cloned()
            .collect()
    }

    /// An isolated copy for a projection branch: shares the parent's
    /// facts, bindings, exclusions, and cancellation, but mutations
    /// on the branch never reach the parent.
    #[must_use]
    pub fn branch(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Schema, TypeDef};
    use std::sync::Arc;

    fn schema() -> ActiveSchema {
        let base = Schema::builder()
            .with_type(TypeDef::scalar("t.DeskId"))
            .with_type(TypeDef::alias("t.ClientDeskId", "t.DeskId"))
            .with_constant("maxRows", Scalar::from(100i64))
            .build();
        ActiveSchema::new(Arc::new(base))
    }

    #[test]
    fn given_binds_argument_over_constant() {
        let schema = schema();
        let mut args = HashMap::new();
        args.insert("maxRows".to_string(), Scalar::from(5i64));

        let bindings =
            bind_given(&["maxRows".to_string()], &args, &schema).unwrap();
        assert_eq!(bindings.get("maxRows"), Some(&Scalar::Int(5)));
    }

    #[test]
    fn given_falls_back_to_schema_constant() {
        let schema = schema();
        let bindings =
            bind_given(&["maxRows".to_string()], &HashMap::new(), &schema).unwrap();
        assert_eq!(bindings.get("maxRows"), Some(&Scalar::Int(100)));
    }

    #[test]
    fn unbound_given_parameter_is_rejected() {
        let schema = schema();
        let err = bind_given(&["missing".to_string()], &HashMap::new(), &schema)
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::MissingGivenBinding { parameter } if parameter == "missing"
        ));
    }

    #[test]
    fn reentrant_resolution_is_a_cycle() {
        let mut ctx = QueryContext::new(schema(), FactBag::new(), vec![FactSetId::All]);
        ctx.enter(&"t.DeskId".into()).unwrap();
        let err = ctx.enter(&"t.DeskId".into()).unwrap_err();
        assert!(matches!(err, ResolutionError::Cycle { .. }));
    }

    #[test]
    fn alias_reentry_is_a_cycle() {
        let mut ctx = QueryContext::new(schema(), FactBag::new(), vec![FactSetId::All]);
        ctx.enter(&"t.DeskId".into()).unwrap();
        let err = ctx.enter(&"t.ClientDeskId".into()).unwrap_err();
        assert!(matches!(err, ResolutionError::Cycle { .. }));
    }

    #[test]
    fn leaving_reopens_the_type() {
        let mut ctx = QueryContext::new(schema(), FactBag::new(), vec![FactSetId::All]);
        ctx.enter(&"t.DeskId".into()).unwrap();
        ctx.leave();
        assert!(ctx.enter(&"t.DeskId".into()).is_ok());
    }

    #[test]
    fn branch_isolates_exclusions() {
        let ctx = QueryContext::new(schema(), FactBag::new(), vec![FactSetId::All]);
        let mut branch = ctx.branch();
        branch.exclude_operation("svc/op");
        assert!(branch.is_excluded("svc/op"));
        assert!(!ctx.is_excluded("svc/op"));
    }
}

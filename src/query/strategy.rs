//! The discovery strategy chain.
//!
//! Resolution tries each strategy in a fixed order until one produces
//! the requested type:
//!
//! 1. [`KnownFactScan`] — a fact of the exact (or alias-equivalent)
//!    type already exists; no remote calls.
//! 2. [`DerivedExpression`] — the type is declared as a formula over
//!    other types; each operand is resolved recursively and the
//!    formula evaluated locally.
//! 3. [`DirectInvocation`] — exactly one operation whose return type
//!    is compatible and whose parameters can all be bound. An exact
//!    return-type match beats an assignable one; a residual tie is an
//!    `AmbiguousCandidate` error, never a silent first-match.
//! 4. [`GenericQuery`] — any operation returning a list compatible
//!    with the target, constraints applied client-side on the result.
//!
//! Recursive resolution runs against the same chain; the context's
//! resolution stack rejects a type that transitively requires itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::debug;

use crate::descriptor::{Constraint, Operation, Service, ValueExpr};
use crate::error::{InvocationError, MeshError, MeshResult, ResolutionError};
use crate::instance::{InstanceValue, Provenance, Scalar, TypedInstance};
use crate::invoke::{BoundParameter, InvocationContext, InvocationPipeline};
use crate::query::QueryContext;
use crate::schema::{ActiveSchema, FormulaOp, QualifiedName, TypeKind};

/// One algorithm in the ordered discovery chain.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    /// The strategy's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Attempts to produce the target. `Ok(None)` means this strategy
    /// does not apply; the chain moves on.
    async fn attempt(
        &self,
        target: &QualifiedName,
        constraints: &[Constraint],
        ctx: &mut QueryContext,
        resolver: &Resolver,
    ) -> MeshResult<Option<TypedInstance>>;
}

/// Runs the ordered strategy chain, recursing for nested types.
pub struct Resolver {
    pipeline: Arc<InvocationPipeline>,
    strategies: Vec<Box<dyn DiscoveryStrategy>>,
}

impl Resolver {
    /// Builds the chain in its fixed order over an invocation
    /// pipeline.
    #[must_use]
    pub fn new(pipeline: Arc<InvocationPipeline>) -> Self {
        Self {
            pipeline,
            strategies: vec![
                Box::new(KnownFactScan),
                Box::new(DerivedExpression),
                Box::new(DirectInvocation),
                Box::new(GenericQuery),
            ],
        }
    }

    /// Resolves the target type, trying each strategy in order.
    ///
    /// Boxed so strategies can recurse through the chain for operand
    /// and parameter types.
    pub fn resolve<'a>(
        &'a self,
        target: &'a QualifiedName,
        constraints: &'a [Constraint],
        ctx: &'a mut QueryContext,
    ) -> BoxFuture<'a, MeshResult<TypedInstance>> {
        async move {
            if ctx.cancel.is_cancelled() {
                return Err(InvocationError::Cancelled.into());
            }
            if !ctx.schema.is_declared(target) {
                return Err(ResolutionError::UnknownType {
                    type_name: target.to_string(),
                }
                .into());
            }
            ctx.enter(target)?;
            let outcome = self.try_each(target, constraints, ctx).await;
            ctx.leave();
            match outcome? {
                Some(value) => Ok(value),
                None => Err(ResolutionError::Unresolved {
                    type_name: target.to_string(),
                }
                .into()),
            }
        }
        .boxed()
    }

    async fn try_each(
        &self,
        target: &QualifiedName,
        constraints: &[Constraint],
        ctx: &mut QueryContext,
    ) -> MeshResult<Option<TypedInstance>> {
        for strategy in &self.strategies {
            if let Some(value) = strategy.attempt(target, constraints, ctx, self).await? {
                debug!(strategy = strategy.name(), target = %target, "resolved");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Evaluates one constraint against an instance. `None` means the
/// constraint cannot be evaluated against this value (e.g. the
/// constrained property is absent); per the client-side filtering
/// rule, an unevaluatable constraint never excludes a value.
fn constraint_check(
    instance: &TypedInstance,
    constraint: &Constraint,
    ctx: &QueryContext,
) -> Option<bool> {
    match constraint {
        // Declares a derivation relationship, not a checkable
        // predicate; it never filters a value.
        Constraint::ReturnValueDerived { .. } => None,
        Constraint::PropertyToParameter {
            property,
            op,
            expected,
        } => {
            let expected = match expected {
                ValueExpr::Constant { value } => value.clone(),
                ValueExpr::Parameter { name } => ctx.bindings.get(name)?.clone(),
            };
            let actual = property_scalar(instance, property, &ctx.schema)?;
            let ordering = actual.compare(&expected)?;
            Some(op.matches(ordering))
        }
    }
}

/// Finds the scalar value of the constrained property: the instance
/// itself when its type matches, otherwise the first attribute of the
/// property's type.
fn property_scalar<'a>(
    instance: &'a TypedInstance,
    property: &QualifiedName,
    schema: &ActiveSchema,
) -> Option<&'a Scalar> {
    if schema.is_exact(&instance.type_name, property) {
        return instance.as_scalar();
    }
    instance
        .attributes()
        .find(|(_, value)| schema.is_exact(&value.type_name, property))
        .and_then(|(_, value)| value.as_scalar())
}

fn passes_constraints(
    instance: &TypedInstance,
    constraints: &[Constraint],
    ctx: &QueryContext,
) -> bool {
    constraints
        .iter()
        .all(|c| constraint_check(instance, c, ctx) != Some(false))
}

/// Strategy 1: a matching fact already exists in the visible sets.
pub struct KnownFactScan;

#[async_trait]
impl DiscoveryStrategy for KnownFactScan {
    fn name(&self) -> &'static str {
        "known-fact-scan"
    }

    async fn attempt(
        &self,
        target: &QualifiedName,
        constraints: &[Constraint],
        ctx: &mut QueryContext,
        _resolver: &Resolver,
    ) -> MeshResult<Option<TypedInstance>> {
        let matches: Vec<TypedInstance> = ctx
            .facts
            .find_by_type(&ctx.schema, target, &ctx.fact_sets)
            .filter(|fact| passes_constraints(fact, constraints, ctx))
            .cloned()
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.clone())),
            [first, rest @ ..] => {
                // Duplicate insertions of the same value are fine;
                // distinct values of the requested type are not a
                // guessable choice.
                if rest.iter().all(|m| m == first) {
                    Ok(Some(first.clone()))
                } else {
                    Err(ResolutionError::AmbiguousCandidate {
                        type_name: target.to_string(),
                        candidates: matches
                            .iter()
                            .map(|m| format!("fact of type {}", m.type_name))
                            .collect(),
                    }
                    .into())
                }
            }
        }
    }
}

/// Strategy 2: the target is a declared formula over other types.
pub struct DerivedExpression;

#[async_trait]
impl DiscoveryStrategy for DerivedExpression {
    fn name(&self) -> &'static str {
        "derived-expression"
    }

    async fn attempt(
        &self,
        target: &QualifiedName,
        _constraints: &[Constraint],
        ctx: &mut QueryContext,
        resolver: &Resolver,
    ) -> MeshResult<Option<TypedInstance>> {
        let Some(TypeKind::Formula { op, operands }) =
            ctx.schema.type_def(target).map(|d| d.kind.clone())
        else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(operands.len());
        for operand in &operands {
            match resolver.resolve(operand, &[], ctx).await {
                Ok(value) => values.push(value),
                // An unresolvable operand just means this path is
                // closed; later strategies may still produce the
                // target directly.
                Err(MeshError::Resolution(ResolutionError::Unresolved { .. })) => {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        }

        let scalar = evaluate_formula(target, op, &values)?;
        Ok(Some(TypedInstance::scalar(
            target.clone(),
            scalar,
            Provenance::Derived { operands },
        )))
    }
}

fn evaluate_formula(
    target: &QualifiedName,
    op: FormulaOp,
    values: &[TypedInstance],
) -> Result<Scalar, ResolutionError> {
    let failed = |reason: &str| ResolutionError::ExpressionFailed {
        type_name: target.to_string(),
        reason: reason.to_string(),
    };
    let scalars: Vec<&Scalar> = values
        .iter()
        .map(|v| v.as_scalar().ok_or_else(|| failed("operand is not a scalar")))
        .collect::<Result<_, _>>()?;
    let (first, rest) = scalars
        .split_first()
        .ok_or_else(|| failed("formula has no operands"))?;

    if op == FormulaOp::Concat {
        let mut out = concat_text(first);
        for s in rest {
            out.push_str(&concat_text(s));
        }
        return Ok(Scalar::String(out));
    }

    let all_ints = scalars.iter().all(|s| s.as_int().is_some());
    if all_ints && op != FormulaOp::Divide {
        let mut acc = first.as_int().unwrap_or_default();
        for s in rest {
            let n = s.as_int().unwrap_or_default();
            acc = match op {
                FormulaOp::Add => acc.wrapping_add(n),
                FormulaOp::Subtract => acc.wrapping_sub(n),
                FormulaOp::Multiply => acc.wrapping_mul(n),
                FormulaOp::Divide | FormulaOp::Concat => unreachable!(),
            };
        }
        return Ok(Scalar::Int(acc));
    }

    let mut acc = first
        .as_float()
        .ok_or_else(|| failed("operand is not numeric"))?;
    for s in rest {
        let n = s.as_float().ok_or_else(|| failed("operand is not numeric"))?;
        acc = match op {
            FormulaOp::Add => acc + n,
            FormulaOp::Subtract => acc - n,
            FormulaOp::Multiply => acc * n,
            FormulaOp::Divide => {
                if n == 0.0 {
                    return Err(failed("division by zero"));
                }
                acc / n
            }
            FormulaOp::Concat => unreachable!(),
        };
    }
    Ok(Scalar::Float(acc))
}

fn concat_text(scalar: &Scalar) -> String {
    match scalar {
        Scalar::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Candidate {
    service: Service,
    operation: Operation,
    params: Vec<BoundParameter>,
    exact: bool,
}

/// Strategy 3: a single compatible operation whose parameters can all
/// be bound from the query's `given` bindings, its constraints
/// matched against the operation's contract, or known facts.
pub struct DirectInvocation;

#[async_trait]
impl DiscoveryStrategy for DirectInvocation {
    fn name(&self) -> &'static str {
        "direct-invocation"
    }

    async fn attempt(
        &self,
        target: &QualifiedName,
        constraints: &[Constraint],
        ctx: &mut QueryContext,
        resolver: &Resolver,
    ) -> MeshResult<Option<TypedInstance>> {
        let mut candidates = Vec::new();
        for (service, operation) in ctx.schema.operations() {
            if ctx.is_excluded(&service.qualified_operation_name(operation)) {
                continue;
            }
            if !ctx.schema.is_assignable(&operation.return_type, target) {
                continue;
            }
            let Some(params) = bind_parameters(operation, constraints, ctx) else {
                continue;
            };
            candidates.push(Candidate {
                service: service.clone(),
                operation: operation.clone(),
                params,
                exact: ctx.schema.base_type(&operation.return_type)
                    == ctx.schema.base_type(target),
            });
        }

        // Exact return-type matches outrank merely assignable ones.
        if candidates.iter().any(|c| c.exact) {
            candidates.retain(|c| c.exact);
        }

        let candidate = match candidates.len() {
            0 => return Ok(None),
            1 => candidates.remove(0),
            _ => {
                return Err(ResolutionError::AmbiguousCandidate {
                    type_name: target.to_string(),
                    candidates: candidates
                        .iter()
                        .map(|c| c.service.qualified_operation_name(&c.operation))
                        .collect(),
                }
                .into())
            }
        };

        let items = invoke_and_collect(
            resolver,
            &candidate.service,
            &candidate.operation,
            &candidate.params,
            ctx,
        )
        .await?;
        let kept: Vec<TypedInstance> = items
            .into_iter()
            .filter(|item| passes_constraints(item, constraints, ctx))
            .collect();

        Ok(shape_result(target, kept, ctx, &candidate.service, &candidate.operation))
    }
}

/// Strategy 4: any operation returning a list whose members are
/// compatible with the target, filtering client-side. Candidates are
/// tried in declaration order; a failing one is excluded and the next
/// tried.
pub struct GenericQuery;

#[async_trait]
impl DiscoveryStrategy for GenericQuery {
    fn name(&self) -> &'static str {
        "generic-query"
    }

    async fn attempt(
        &self,
        target: &QualifiedName,
        constraints: &[Constraint],
        ctx: &mut QueryContext,
        resolver: &Resolver,
    ) -> MeshResult<Option<TypedInstance>> {
        let mut candidates = Vec::new();
        for (service, operation) in ctx.schema.operations() {
            if ctx.is_excluded(&service.qualified_operation_name(operation)) {
                continue;
            }
            let list_compatible = ctx
                .schema
                .collection_member(&operation.return_type)
                .is_some_and(|member| ctx.schema.is_assignable(&member, target))
                || ctx.schema.is_assignable(&operation.return_type, target);
            if !list_compatible {
                continue;
            }
            let Some(params) = bind_parameters(operation, constraints, ctx) else {
                continue;
            };
            candidates.push((service.clone(), operation.clone(), params));
        }

        for (service, operation, params) in candidates {
            let items = match invoke_and_collect(resolver, &service, &operation, &params, ctx)
                .await
            {
                Ok(items) => items,
                Err(err) => {
                    debug!(
                        operation = %service.qualified_operation_name(&operation),
                        error = %err,
                        "generic candidate failed, trying next"
                    );
                    continue;
                }
            };
            let kept: Vec<TypedInstance> = items
                .into_iter()
                .filter(|item| passes_constraints(item, constraints, ctx))
                .collect();
            if let Some(result) = shape_result(target, kept, ctx, &service, &operation) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}

/// Binds every parameter of the operation or gives up on the
/// candidate. Sources, in order: the query's `given` bindings, a
/// query constraint matched against the operation's declared contract,
/// a single unambiguous known fact of the parameter's type.
fn bind_parameters(
    operation: &Operation,
    constraints: &[Constraint],
    ctx: &QueryContext,
) -> Option<Vec<BoundParameter>> {
    let mut bound = Vec::with_capacity(operation.parameters.len());
    for param in &operation.parameters {
        if let Some(scalar) = ctx.bindings.get(&param.name) {
            bound.push(BoundParameter::new(
                param.name.clone(),
                TypedInstance::scalar(
                    param.type_name.clone(),
                    scalar.clone(),
                    Provenance::Provided,
                ),
            ));
            continue;
        }
        if let Some(value) = constraint_bound_value(operation, &param.name, constraints, ctx) {
            bound.push(BoundParameter::new(
                param.name.clone(),
                TypedInstance::scalar(param.type_name.clone(), value, Provenance::Provided),
            ));
            continue;
        }
        let facts: Vec<&TypedInstance> = ctx
            .facts
            .find_by_type(&ctx.schema, &param.type_name, &ctx.fact_sets)
            .collect();
        match facts.as_slice() {
            [only] => {
                bound.push(BoundParameter::new(param.name.clone(), (*only).clone()));
            }
            _ => return None,
        }
    }
    Some(bound)
}

/// Matches a query constraint against the operation's contract: a
/// contract entry `property op $param` satisfied by a query constraint
/// `property op <constant>` binds the constant to `param`.
fn constraint_bound_value(
    operation: &Operation,
    param_name: &str,
    constraints: &[Constraint],
    ctx: &QueryContext,
) -> Option<Scalar> {
    for contract in &operation.contract {
        let Constraint::PropertyToParameter {
            property: contract_property,
            op: contract_op,
            expected: ValueExpr::Parameter { name },
        } = contract
        else {
            continue;
        };
        if name != param_name {
            continue;
        }
        for constraint in constraints {
            if let Constraint::PropertyToParameter {
                property,
                op,
                expected: ValueExpr::Constant { value },
            } = constraint
            {
                if op == contract_op && ctx.schema.is_exact(property, contract_property) {
                    return Some(value.clone());
                }
            }
        }
    }
    None
}

/// Invokes through the pipeline and collects the emitted items,
/// flattening emitted collections into their members. A failing
/// operation is excluded from retry within the same query.
async fn invoke_and_collect(
    resolver: &Resolver,
    service: &Service,
    operation: &Operation,
    params: &[BoundParameter],
    ctx: &mut QueryContext,
) -> MeshResult<Vec<TypedInstance>> {
    let qualified = service.qualified_operation_name(operation);
    let invocation_ctx = InvocationContext {
        query_id: ctx.query_id,
        cancel: ctx.cancel.clone(),
        caller_facts: ctx.caller_facts(),
    };

    let mut stream = match resolver
        .pipeline
        .invoke(&ctx.schema, service, operation, params, &invocation_ctx)
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            ctx.exclude_operation(qualified.as_str());
            return Err(err.into());
        }
    };

    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(instance) => match instance.value {
                InstanceValue::Collection { items: members } => items.extend(members),
                _ => items.push(instance),
            },
            Err(err) => {
                ctx.exclude_operation(qualified.as_str());
                return Err(err.into());
            }
        }
    }
    Ok(items)
}

/// Shapes collected items to the target: a collection target wraps
/// them (empty is a valid result), a single target takes the first
/// surviving item or defers to the next strategy.
fn shape_result(
    target: &QualifiedName,
    kept: Vec<TypedInstance>,
    ctx: &QueryContext,
    service: &Service,
    operation: &Operation,
) -> Option<TypedInstance> {
    if ctx.schema.collection_member(target).is_some() {
        let provenance = kept.first().map_or_else(
            || Provenance::RemoteCall {
                operation: service.qualified_operation_name(operation),
                query_id: ctx.query_id,
            },
            |item| item.provenance.clone(),
        );
        Some(TypedInstance::collection(target.clone(), kept, provenance))
    } else {
        kept.into_iter().next()
    }
}

//! Policy evaluation: rule-set selection and value masking.
//!
//! Every value emitted by an invocation passes through the policy
//! decorator before it is handed back to the resolution that asked
//! for it. The decorator computes an [`ExecutionScope`] from the
//! operation's declared metadata, selects the single best-scoring
//! [`RuleSet`], and applies the first matching statement's
//! [`Instruction`] to each emitted item independently.

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::descriptor::{Operation, OperationMetadata};
use crate::error::InvocationError;
use crate::instance::{Scalar, TypedInstance};
use crate::invoke::InstanceStream;
use crate::schema::{ActiveSchema, QualifiedName};

/// Classification of an invocation, computed from operation metadata
/// and matched against rule-set scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionScope {
    /// The kind of operation, e.g. `read` or `write`.
    #[serde(default)]
    pub operation_type: Option<String>,
    /// The declared scope, e.g. `external` or `internal`.
    #[serde(default)]
    pub operation_scope: Option<String>,
}

impl ExecutionScope {
    /// Creates a fully-specified scope.
    pub fn new(
        operation_type: impl Into<String>,
        operation_scope: impl Into<String>,
    ) -> Self {
        Self {
            operation_type: Some(operation_type.into()),
            operation_scope: Some(operation_scope.into()),
        }
    }

    /// Computes the scope of an invocation from operation metadata.
    #[must_use]
    pub fn from_metadata(metadata: &OperationMetadata) -> Self {
        Self {
            operation_type: metadata.operation_type.clone(),
            operation_scope: metadata.operation_scope.clone(),
        }
    }

    /// Scores a declared rule-set scope against this execution scope.
    ///
    /// Each declared field that matches counts one; a declared field
    /// that contradicts the execution scope disqualifies the rule set
    /// entirely. Undeclared fields are wildcards and count zero.
    #[must_use]
    pub fn score(&self, declared: &ExecutionScope) -> Option<u32> {
        let mut score = 0;
        match (&declared.operation_type, &self.operation_type) {
            (Some(d), Some(a)) if d == a => score += 1,
            (Some(_), _) => return None,
            (None, _) => {}
        }
        match (&declared.operation_scope, &self.operation_scope) {
            (Some(d), Some(a)) if d == a => score += 1,
            (Some(_), _) => return None,
            (None, _) => {}
        }
        Some(score)
    }
}

/// One side of a policy case condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum Subject {
    /// A fact of the given type, scoped to the caller.
    Caller {
        /// The fact type to look up.
        type_name: QualifiedName,
    },
    /// An attribute of the value under evaluation, identified by its
    /// declared type.
    This {
        /// The attribute type to look up.
        type_name: QualifiedName,
    },
    /// A literal scalar.
    Literal {
        /// The literal.
        value: Scalar,
    },
    /// A literal list, for `in` / `not in` comparisons.
    LiteralList {
        /// The list members.
        values: Vec<Scalar>,
    },
    /// The literal null.
    Null,
}

/// Comparison operator in a case condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOperator {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// Membership in a list subject.
    In,
    /// Non-membership in a list subject.
    NotIn,
}

/// A statement's condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// Matches unconditionally.
    Else,
    /// Matches when the comparison holds.
    Case {
        /// The operator.
        op: PolicyOperator,
        /// Left subject.
        left: Subject,
        /// Right subject.
        right: Subject,
    },
}

/// What to do with a value once a statement matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "snake_case")]
pub enum Instruction {
    /// Pass the value through unchanged.
    Permit,
    /// Replace the whole value with a typed null of the same type.
    FilterAll,
    /// Replace only the named attributes with typed nulls.
    FilterFields {
        /// The attribute names to null out.
        fields: Vec<String>,
    },
}

/// A condition/instruction pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatement {
    /// When this statement matches.
    pub condition: Condition,
    /// What it does when it matches.
    pub instruction: Instruction,
}

impl PolicyStatement {
    /// Creates a statement.
    #[must_use]
    pub fn new(condition: Condition, instruction: Instruction) -> Self {
        Self {
            condition,
            instruction,
        }
    }

    /// Creates an unconditional statement.
    #[must_use]
    pub fn otherwise(instruction: Instruction) -> Self {
        Self {
            condition: Condition::Else,
            instruction,
        }
    }
}

/// A scoped, ordered list of policy statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// The declared scope this rule set applies to.
    pub scope: ExecutionScope,
    /// Statements, evaluated top to bottom; the first match applies.
    pub statements: Vec<PolicyStatement>,
}

impl RuleSet {
    /// Creates a rule set.
    #[must_use]
    pub fn new(scope: ExecutionScope, statements: Vec<PolicyStatement>) -> Self {
        Self { scope, statements }
    }
}

/// Selects the single rule set whose declared scope scores highest
/// against the execution scope.
///
/// Tie-break is declaration order: of equally-scoring rule sets, the
/// first declared wins. This keeps selection deterministic across
/// runs.
#[must_use]
pub fn select_rule_set<'a>(
    rule_sets: &'a [RuleSet],
    scope: &ExecutionScope,
) -> Option<&'a RuleSet> {
    let mut best: Option<(u32, &RuleSet)> = None;
    for rule_set in rule_sets {
        let Some(score) = scope.score(&rule_set.scope) else {
            continue;
        };
        match &best {
            Some((best_score, _)) if *best_score >= score => {}
            _ => best = Some((score, rule_set)),
        }
    }
    best.map(|(_, rs)| rs)
}

/// A subject resolved to a concrete comparison operand.
#[derive(Debug, Clone, PartialEq)]
enum ResolvedSubject {
    Value(Scalar),
    List(Vec<Scalar>),
    Null,
}

fn scalars_of(instance: &TypedInstance) -> Option<Vec<Scalar>> {
    let items = instance.as_collection()?;
    items
        .iter()
        .map(|i| i.as_scalar().cloned())
        .collect::<Option<Vec<_>>>()
}

fn resolve_subject(
    subject: &Subject,
    value: &TypedInstance,
    caller_facts: &[TypedInstance],
    schema: &ActiveSchema,
) -> Result<ResolvedSubject, InvocationError> {
    match subject {
        Subject::Literal { value } => Ok(ResolvedSubject::Value(value.clone())),
        Subject::LiteralList { values } => Ok(ResolvedSubject::List(values.clone())),
        Subject::Null => Ok(ResolvedSubject::Null),
        Subject::Caller { type_name } => {
            let target = schema.base_type(type_name);
            let fact = caller_facts
                .iter()
                .find(|f| schema.base_type(&f.type_name) == target)
                .or_else(|| {
                    // Caller facts may be objects carrying the subject
                    // as an attribute, e.g. a User with a DeskId field.
                    caller_facts.iter().find_map(|f| {
                        f.attributes()
                            .map(|(_, v)| v)
                            .find(|v| schema.base_type(&v.type_name) == target)
                    })
                })
                .ok_or_else(|| InvocationError::PolicyNotEvaluatable {
                    subject: format!("caller.{type_name}"),
                })?;
            if fact.is_null() {
                Ok(ResolvedSubject::Null)
            } else if let Some(scalar) = fact.as_scalar() {
                Ok(ResolvedSubject::Value(scalar.clone()))
            } else if let Some(scalars) = scalars_of(fact) {
                Ok(ResolvedSubject::List(scalars))
            } else {
                Err(InvocationError::PolicyNotEvaluatable {
                    subject: format!("caller.{type_name} is not a comparable value"),
                })
            }
        }
        Subject::This { type_name } => {
            let target = schema.base_type(type_name);
            let attr = value
                .attributes()
                .map(|(_, v)| v)
                .find(|v| schema.base_type(&v.type_name) == target);
            // An absent attribute evaluates as null rather than
            // failing: policies routinely compare against fields the
            // value may not carry.
            match attr {
                None => Ok(ResolvedSubject::Null),
                Some(a) if a.is_null() => Ok(ResolvedSubject::Null),
                Some(a) => match (a.as_scalar(), scalars_of(a)) {
                    (Some(scalar), _) => Ok(ResolvedSubject::Value(scalar.clone())),
                    (None, Some(scalars)) => Ok(ResolvedSubject::List(scalars)),
                    (None, None) => Err(InvocationError::PolicyNotEvaluatable {
                        subject: format!("this.{type_name} is not a comparable value"),
                    }),
                },
            }
        }
    }
}

fn condition_matches(
    condition: &Condition,
    value: &TypedInstance,
    caller_facts: &[TypedInstance],
    schema: &ActiveSchema,
) -> Result<bool, InvocationError> {
    let Condition::Case { op, left, right } = condition else {
        return Ok(true);
    };
    let left = resolve_subject(left, value, caller_facts, schema)?;
    let right = resolve_subject(right, value, caller_facts, schema)?;

    let matched = match op {
        PolicyOperator::Equal => subjects_equal(&left, &right),
        PolicyOperator::NotEqual => !subjects_equal(&left, &right),
        PolicyOperator::In => subject_in(&left, &right),
        PolicyOperator::NotIn => !subject_in(&left, &right),
    };
    Ok(matched)
}

fn subjects_equal(left: &ResolvedSubject, right: &ResolvedSubject) -> bool {
    match (left, right) {
        (ResolvedSubject::Null, ResolvedSubject::Null) => true,
        (ResolvedSubject::Value(a), ResolvedSubject::Value(b)) => {
            a.compare(b) == Some(std::cmp::Ordering::Equal)
        }
        _ => false,
    }
}

fn subject_in(left: &ResolvedSubject, right: &ResolvedSubject) -> bool {
    let members = match right {
        ResolvedSubject::List(values) => values.as_slice(),
        _ => return false,
    };
    match left {
        ResolvedSubject::Value(v) => members
            .iter()
            .any(|m| m.compare(v) == Some(std::cmp::Ordering::Equal)),
        // A list subject is "in" when any of its members is.
        ResolvedSubject::List(values) => values.iter().any(|v| {
            members
                .iter()
                .any(|m| m.compare(v) == Some(std::cmp::Ordering::Equal))
        }),
        ResolvedSubject::Null => false,
    }
}

/// Evaluates a rule set's statements top to bottom against one value
/// and returns the first matching statement's instruction.
///
/// When no statement matches (a rule set with no `else`), the value
/// is permitted.
pub fn evaluate(
    rule_set: &RuleSet,
    value: &TypedInstance,
    caller_facts: &[TypedInstance],
    schema: &ActiveSchema,
) -> Result<Instruction, InvocationError> {
    for statement in &rule_set.statements {
        if condition_matches(&statement.condition, value, caller_facts, schema)? {
            return Ok(statement.instruction.clone());
        }
    }
    Ok(Instruction::Permit)
}

/// Applies an instruction to a single value.
#[must_use]
pub fn apply_instruction(instruction: &Instruction, value: &TypedInstance) -> TypedInstance {
    match instruction {
        Instruction::Permit => value.clone(),
        Instruction::FilterAll => {
            TypedInstance::typed_null(value.type_name.clone(), value.provenance.clone())
        }
        Instruction::FilterFields { fields } => value.mask_attributes(fields),
    }
}

/// The policy stage of the invocation pipeline.
///
/// Built once from the schema's rule-set declarations; applies the
/// selected rule set independently to every item of a stream.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecorator {
    rule_sets: Vec<RuleSet>,
}

impl PolicyDecorator {
    /// Creates the decorator from declared rule sets.
    #[must_use]
    pub fn new(rule_sets: Vec<RuleSet>) -> Self {
        Self { rule_sets }
    }

    /// Wraps a result stream with per-item policy enforcement for the
    /// given operation. With no applicable rule set the stream passes
    /// through untouched.
    #[must_use]
    pub fn apply(
        &self,
        schema: &ActiveSchema,
        operation: &Operation,
        caller_facts: Vec<TypedInstance>,
        stream: InstanceStream,
    ) -> InstanceStream {
        let scope = ExecutionScope::from_metadata(&operation.metadata);
        let Some(rule_set) = select_rule_set(&self.rule_sets, &scope) else {
            return stream;
        };
        let rule_set = rule_set.clone();
        let schema = schema.clone();
        stream
            .map(move |item| {
                let value = item?;
                let instruction = evaluate(&rule_set, &value, &caller_facts, &schema)?;
                Ok(apply_instruction(&instruction, &value))
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Provenance;
    use crate::schema::{Schema, TypeDef};
    use std::sync::Arc;

    fn schema() -> ActiveSchema {
        let base = Schema::builder()
            .with_type(TypeDef::scalar("t.DeskId"))
            .with_type(TypeDef::alias("t.ClientDeskId", "t.DeskId"))
            .with_type(TypeDef::scalar("t.Amount"))
            .with_type(TypeDef::object(
                "t.Trade",
                vec![
                    ("deskId".to_string(), QualifiedName::from("t.ClientDeskId")),
                    ("amount".to_string(), QualifiedName::from("t.Amount")),
                ],
            ))
            .build();
        ActiveSchema::new(Arc::new(base))
    }

    fn trade(desk: &str) -> TypedInstance {
        TypedInstance::object(
            "t.Trade",
            vec![
                (
                    "deskId".to_string(),
                    TypedInstance::scalar("t.ClientDeskId", desk, Provenance::Provided),
                ),
                (
                    "amount".to_string(),
                    TypedInstance::scalar("t.Amount", 100i64, Provenance::Provided),
                ),
            ],
            Provenance::Provided,
        )
    }

    fn caller_desk(desk: &str) -> TypedInstance {
        TypedInstance::scalar("t.DeskId", desk, Provenance::Provided)
    }

    fn desk_match_rule_set() -> RuleSet {
        RuleSet::new(
            ExecutionScope::new("read", "external"),
            vec![
                PolicyStatement::new(
                    Condition::Case {
                        op: PolicyOperator::Equal,
                        left: Subject::Caller {
                            type_name: "t.DeskId".into(),
                        },
                        right: Subject::This {
                            type_name: "t.ClientDeskId".into(),
                        },
                    },
                    Instruction::Permit,
                ),
                PolicyStatement::otherwise(Instruction::FilterAll),
            ],
        )
    }

    #[test]
    fn scoring_counts_matching_fields() {
        let actual = ExecutionScope::new("read", "external");
        assert_eq!(actual.score(&ExecutionScope::new("read", "external")), Some(2));
        assert_eq!(
            actual.score(&ExecutionScope {
                operation_type: Some("read".to_string()),
                operation_scope: None,
            }),
            Some(1)
        );
        assert_eq!(actual.score(&ExecutionScope::default()), Some(0));
    }

    #[test]
    fn contradicting_scope_disqualifies() {
        let actual = ExecutionScope::new("read", "external");
        assert_eq!(actual.score(&ExecutionScope::new("write", "external")), None);
    }

    #[test]
    fn selection_prefers_higher_score_deterministically() {
        let score_one = RuleSet::new(
            ExecutionScope {
                operation_type: Some("read".to_string()),
                operation_scope: None,
            },
            vec![PolicyStatement::otherwise(Instruction::FilterAll)],
        );
        let score_two = RuleSet::new(
            ExecutionScope::new("read", "external"),
            vec![PolicyStatement::otherwise(Instruction::Permit)],
        );
        let sets = vec![score_one, score_two.clone()];
        let actual = ExecutionScope::new("read", "external");

        for _ in 0..10 {
            assert_eq!(select_rule_set(&sets, &actual), Some(&score_two));
        }
    }

    #[test]
    fn selection_tie_breaks_by_declaration_order() {
        let first = RuleSet::new(
            ExecutionScope::new("read", "external"),
            vec![PolicyStatement::otherwise(Instruction::Permit)],
        );
        let second = RuleSet::new(
            ExecutionScope::new("read", "external"),
            vec![PolicyStatement::otherwise(Instruction::FilterAll)],
        );
        let sets = vec![first.clone(), second];
        assert_eq!(
            select_rule_set(&sets, &ExecutionScope::new("read", "external")),
            Some(&first)
        );
    }

    #[test]
    fn permit_is_identity() {
        let t = trade("desk1");
        assert_eq!(apply_instruction(&Instruction::Permit, &t), t);
    }

    #[test]
    fn filter_all_yields_type_preserving_null() {
        let t = trade("desk1");
        let filtered = apply_instruction(&Instruction::FilterAll, &t);
        assert!(filtered.is_null());
        assert_eq!(filtered.type_name, t.type_name);
    }

    #[test]
    fn filter_fields_nulls_only_named_attributes() {
        let t = trade("desk1");
        let filtered = apply_instruction(
            &Instruction::FilterFields {
                fields: vec!["amount".to_string()],
            },
            &t,
        );
        assert!(filtered.attribute("amount").unwrap().is_null());
        assert_eq!(filtered.attribute("deskId"), t.attribute("deskId"));
    }

    #[test]
    fn matching_desk_is_permitted() {
        let schema = schema();
        let rule_set = desk_match_rule_set();
        let instruction = evaluate(
            &rule_set,
            &trade("desk1"),
            &[caller_desk("desk1")],
            &schema,
        )
        .unwrap();
        assert_eq!(instruction, Instruction::Permit);
    }

    #[test]
    fn mismatched_desk_is_filtered() {
        let schema = schema();
        let rule_set = desk_match_rule_set();
        let instruction = evaluate(
            &rule_set,
            &trade("desk2"),
            &[caller_desk("desk1")],
            &schema,
        )
        .unwrap();
        assert_eq!(instruction, Instruction::FilterAll);
    }

    #[test]
    fn missing_caller_fact_is_not_evaluatable() {
        let schema = schema();
        let rule_set = desk_match_rule_set();
        let err = evaluate(&rule_set, &trade("desk1"), &[], &schema).unwrap_err();
        assert!(matches!(err, InvocationError::PolicyNotEvaluatable { .. }));
    }

    #[test]
    fn caller_subject_found_inside_object_fact() {
        let schema = schema();
        let user = TypedInstance::object(
            "t.Trade", // shape is irrelevant; the attribute type matters
            vec![(
                "deskId".to_string(),
                TypedInstance::scalar("t.DeskId", "desk1", Provenance::Provided),
            )],
            Provenance::Provided,
        );
        let rule_set = desk_match_rule_set();
        let instruction = evaluate(&rule_set, &trade("desk1"), &[user], &schema).unwrap();
        assert_eq!(instruction, Instruction::Permit);
    }

    #[test]
    fn in_operator_checks_membership() {
        let schema = schema();
        let rule_set = RuleSet::new(
            ExecutionScope::default(),
            vec![
                PolicyStatement::new(
                    Condition::Case {
                        op: PolicyOperator::In,
                        left: Subject::Caller {
                            type_name: "t.DeskId".into(),
                        },
                        right: Subject::LiteralList {
                            values: vec![Scalar::from("desk1"), Scalar::from("desk9")],
                        },
                    },
                    Instruction::Permit,
                ),
                PolicyStatement::otherwise(Instruction::FilterAll),
            ],
        );
        let permitted = evaluate(
            &rule_set,
            &trade("desk1"),
            &[caller_desk("desk1")],
            &schema,
        )
        .unwrap();
        assert_eq!(permitted, Instruction::Permit);

        let filtered = evaluate(
            &rule_set,
            &trade("desk1"),
            &[caller_desk("desk2")],
            &schema,
        )
        .unwrap();
        assert_eq!(filtered, Instruction::FilterAll);
    }

    #[test]
    fn null_comparison_matches_null_caller_fact() {
        let schema = schema();
        let rule_set = RuleSet::new(
            ExecutionScope::default(),
            vec![
                PolicyStatement::new(
                    Condition::Case {
                        op: PolicyOperator::Equal,
                        left: Subject::Caller {
                            type_name: "t.DeskId".into(),
                        },
                        right: Subject::Null,
                    },
                    Instruction::FilterAll,
                ),
                PolicyStatement::otherwise(Instruction::Permit),
            ],
        );
        let null_desk = TypedInstance::typed_null("t.DeskId", Provenance::Provided);
        let instruction = evaluate(&rule_set, &trade("desk1"), &[null_desk], &schema).unwrap();
        assert_eq!(instruction, Instruction::FilterAll);
    }

    #[test]
    fn no_matching_statement_permits() {
        let schema = schema();
        let rule_set = RuleSet::new(
            ExecutionScope::default(),
            vec![PolicyStatement::new(
                Condition::Case {
                    op: PolicyOperator::Equal,
                    left: Subject::Literal {
                        value: Scalar::from("a"),
                    },
                    right: Subject::Literal {
                        value: Scalar::from("b"),
                    },
                },
                Instruction::FilterAll,
            )],
        );
        let instruction = evaluate(
            &rule_set,
            &trade("desk1"),
            &[caller_desk("desk1")],
            &schema,
        )
        .unwrap();
        assert_eq!(instruction, Instruction::Permit);
    }
}

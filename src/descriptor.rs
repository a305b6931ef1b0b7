//! Service and operation descriptors.
//!
//! Descriptors come from the schema compiler (an external
//! collaborator) and are immutable for the lifetime of a schema
//! snapshot. They declare what each remote operation accepts and
//! returns, the contract its results honor, and the metadata used to
//! compute the policy execution scope of an invocation.

use serde::{Deserialize, Serialize};

use crate::instance::Scalar;
use crate::schema::QualifiedName;

/// Comparison operator appearing in constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintOperator {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
}

impl ConstraintOperator {
    /// Applies the operator to an ordering between the constrained
    /// property and the expected value.
    #[must_use]
    pub fn matches(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Equal => ordering == Equal,
            Self::NotEqual => ordering != Equal,
            Self::GreaterThan => ordering == Greater,
            Self::GreaterThanOrEqual => ordering != Less,
            Self::LessThan => ordering == Less,
            Self::LessThanOrEqual => ordering != Greater,
        }
    }
}

/// The right-hand side of a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum ValueExpr {
    /// A literal value, e.g. the constant in a query's `where` clause.
    Constant {
        /// The literal.
        value: Scalar,
    },
    /// A reference to one of the operation's named parameters.
    Parameter {
        /// The parameter name.
        name: String,
    },
}

/// A declared condition an operation's parameters or result must
/// satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "constraint", rename_all = "snake_case")]
pub enum Constraint {
    /// A property of the result, identified by its declared type, is
    /// compared against an expected value.
    PropertyToParameter {
        /// The type of the constrained property.
        property: QualifiedName,
        /// The comparison operator.
        op: ConstraintOperator,
        /// The expected value: constant in a query requirement,
        /// a parameter reference in an operation contract.
        expected: ValueExpr,
    },
    /// The return value is derived from a named parameter.
    ReturnValueDerived {
        /// The parameter the result derives from.
        parameter: String,
    },
}

impl Constraint {
    /// Convenience constructor for a property/constant requirement.
    pub fn property(
        property: impl Into<QualifiedName>,
        op: ConstraintOperator,
        value: impl Into<Scalar>,
    ) -> Self {
        Self::PropertyToParameter {
            property: property.into(),
            op,
            expected: ValueExpr::Constant {
                value: value.into(),
            },
        }
    }

    /// Convenience constructor for a property/parameter contract.
    pub fn property_param(
        property: impl Into<QualifiedName>,
        op: ConstraintOperator,
        parameter: impl Into<String>,
    ) -> Self {
        Self::PropertyToParameter {
            property: property.into(),
            op,
            expected: ValueExpr::Parameter {
                name: parameter.into(),
            },
        }
    }
}

/// A declared operation parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// The parameter name, referenced by contracts and `given` clauses.
    pub name: String,
    /// The declared parameter type.
    pub type_name: QualifiedName,
    /// Optional constraints on acceptable argument values.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Parameter {
    /// Creates an unconstrained parameter.
    pub fn new(name: impl Into<String>, type_name: impl Into<QualifiedName>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            constraints: Vec::new(),
        }
    }
}

/// Metadata declared on an operation, used to compute the policy
/// execution scope of each invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// The kind of operation, e.g. `read` or `write`.
    #[serde(default)]
    pub operation_type: Option<String>,
    /// The declared scope, e.g. `external` or `internal`.
    #[serde(default)]
    pub operation_scope: Option<String>,
}

impl OperationMetadata {
    /// Creates metadata with both fields set.
    pub fn new(
        operation_type: impl Into<String>,
        operation_scope: impl Into<String>,
    ) -> Self {
        Self {
            operation_type: Some(operation_type.into()),
            operation_scope: Some(operation_scope.into()),
        }
    }
}

/// A remote operation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The operation name, unique within its service.
    pub name: String,
    /// Ordered parameters.
    pub parameters: Vec<Parameter>,
    /// The declared return type.
    pub return_type: QualifiedName,
    /// The declared contract: constraints the output honors.
    #[serde(default)]
    pub contract: Vec<Constraint>,
    /// Policy-relevant metadata.
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl Operation {
    /// Creates an operation with no contract and empty metadata.
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<Parameter>,
        return_type: impl Into<QualifiedName>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            return_type: return_type.into(),
            contract: Vec::new(),
            metadata: OperationMetadata::default(),
        }
    }

    /// Sets the declared contract.
    #[must_use]
    pub fn with_contract(mut self, contract: Vec<Constraint>) -> Self {
        self.contract = contract;
        self
    }

    /// Sets the policy metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A remote service descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// The service's qualified name.
    pub name: QualifiedName,
    /// The transport this service is invoked over, used to select a
    /// protocol invoker (e.g. `http`, `sql`).
    pub transport: String,
    /// The operations the service exposes.
    pub operations: Vec<Operation>,
}

impl Service {
    /// Creates a service descriptor.
    pub fn new(
        name: impl Into<QualifiedName>,
        transport: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            name: name.into(),
            transport: transport.into(),
            operations,
        }
    }

    /// The qualified name of one of this service's operations,
    /// e.g. `orders.OrderService/findOrdersAfter`.
    #[must_use]
    pub fn qualified_operation_name(&self, operation: &Operation) -> String {
        format!("{}/{}", self.name, operation.name)
    }
}

//! Schema snapshot types.
//!
//! A [`Schema`] is an immutable snapshot of the shared semantic model:
//! type definitions, service/operation descriptors, policy rule sets,
//! and named constants. It is read-only for the lifetime of a query.
//!
//! Queries may declare additional types inline; these are layered on
//! top of the snapshot through [`ActiveSchema`] for the duration of a
//! single query and never mutate the shared snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{Operation, Service};
use crate::instance::Scalar;
use crate::invoke::policy::RuleSet;

/// A dot-qualified type name, e.g. `orders.Order`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualifiedName(String);

impl QualifiedName {
    /// Creates a qualified name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the full name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QualifiedName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QualifiedName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Operator used in a derived-type formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaOp {
    /// Numeric addition.
    Add,
    /// Numeric subtraction.
    Subtract,
    /// Numeric multiplication.
    Multiply,
    /// Numeric division.
    Divide,
    /// String concatenation.
    Concat,
}

/// The shape of a declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    /// An opaque primitive value.
    Scalar,
    /// A structured value with named, typed attributes.
    Object {
        /// Attribute name to attribute type.
        attributes: Vec<(String, QualifiedName)>,
    },
    /// An ordered collection of member values.
    Collection {
        /// The member type.
        member: QualifiedName,
    },
    /// A name that resolves to another type for matching purposes.
    Alias {
        /// The aliased type.
        target: QualifiedName,
    },
    /// A type derived by evaluating a formula over operand types.
    Formula {
        /// The formula operator.
        op: FormulaOp,
        /// The operand types, resolved recursively at query time.
        operands: Vec<QualifiedName>,
    },
}

/// A named type definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// The type's qualified name.
    pub name: QualifiedName,
    /// The type's shape.
    pub kind: TypeKind,
}

impl TypeDef {
    /// Creates a scalar type definition.
    pub fn scalar(name: impl Into<QualifiedName>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Scalar,
        }
    }

    /// Creates an alias type definition.
    pub fn alias(name: impl Into<QualifiedName>, target: impl Into<QualifiedName>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Alias {
                target: target.into(),
            },
        }
    }

    /// Creates an object type definition.
    pub fn object(
        name: impl Into<QualifiedName>,
        attributes: Vec<(String, QualifiedName)>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Object { attributes },
        }
    }

    /// Creates a collection type definition.
    pub fn collection(name: impl Into<QualifiedName>, member: impl Into<QualifiedName>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Collection {
                member: member.into(),
            },
        }
    }

    /// Creates a formula type definition.
    pub fn formula(
        name: impl Into<QualifiedName>,
        op: FormulaOp,
        operands: Vec<QualifiedName>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Formula { op, operands },
        }
    }
}

/// An immutable schema snapshot.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: HashMap<QualifiedName, TypeDef>,
    services: Vec<Service>,
    rule_sets: Vec<RuleSet>,
    constants: HashMap<String, Scalar>,
}

impl Schema {
    /// Starts building a schema snapshot.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up a type definition by name.
    #[must_use]
    pub fn type_def(&self, name: &QualifiedName) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// All declared services.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Policy rule sets, in declaration order.
    #[must_use]
    pub fn rule_sets(&self) -> &[RuleSet] {
        &self.rule_sets
    }

    /// Looks up a schema-declared constant by parameter name.
    #[must_use]
    pub fn constant(&self, name: &str) -> Option<&Scalar> {
        self.constants.get(name)
    }
}

/// Builder for [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    types: Vec<TypeDef>,
    services: Vec<Service>,
    rule_sets: Vec<RuleSet>,
    constants: HashMap<String, Scalar>,
}

impl SchemaBuilder {
    /// Declares a type.
    #[must_use]
    pub fn with_type(mut self, def: TypeDef) -> Self {
        self.types.push(def);
        self
    }

    /// Declares a service.
    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Declares a policy rule set. Declaration order is significant:
    /// it is the tie-break when two rule sets score equally.
    #[must_use]
    pub fn with_rule_set(mut self, rule_set: RuleSet) -> Self {
        self.rule_sets.push(rule_set);
        self
    }

    /// Declares a named constant usable in `given {}` clauses.
    #[must_use]
    pub fn with_constant(mut self, name: impl Into<String>, value: Scalar) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    /// Finalizes the snapshot.
    #[must_use]
    pub fn build(self) -> Schema {
        let types = self
            .types
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Schema {
            types,
            services: self.services,
            rule_sets: self.rule_sets,
            constants: self.constants,
        }
    }
}

/// The schema active for one query: the shared snapshot plus any
/// inline types declared by the query itself.
///
/// Cloning is cheap; both layers are shared.
#[derive(Debug, Clone)]
pub struct ActiveSchema {
    base: Arc<Schema>,
    inline: Arc<HashMap<QualifiedName, TypeDef>>,
}

impl ActiveSchema {
    /// Wraps a snapshot with no inline types.
    #[must_use]
    pub fn new(base: Arc<Schema>) -> Self {
        Self {
            base,
            inline: Arc::new(HashMap::new()),
        }
    }

    /// Layers inline type definitions over the snapshot for the
    /// duration of one query. The snapshot itself is not mutated.
    #[must_use]
    pub fn with_inline_types(base: Arc<Schema>, inline: Vec<TypeDef>) -> Self {
        let inline = inline
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self {
            base,
            inline: Arc::new(inline),
        }
    }

    /// Looks up a type, preferring inline declarations.
    #[must_use]
    pub fn type_def(&self, name: &QualifiedName) -> Option<&TypeDef> {
        self.inline
            .get(name)
            .or_else(|| self.base.type_def(name))
    }

    /// Returns true when the name is declared in either layer.
    #[must_use]
    pub fn is_declared(&self, name: &QualifiedName) -> bool {
        self.type_def(name).is_some()
    }

    /// All declared services. Inline declarations cannot add services.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        self.base.services()
    }

    /// All `(service, operation)` pairs.
    pub fn operations(&self) -> impl Iterator<Item = (&Service, &Operation)> {
        self.base
            .services()
            .iter()
            .flat_map(|s| s.operations.iter().map(move |op| (s, op)))
    }

    /// Policy rule sets, in declaration order.
    #[must_use]
    pub fn rule_sets(&self) -> &[RuleSet] {
        self.base.rule_sets()
    }

    /// Looks up a schema-declared constant.
    #[must_use]
    pub fn constant(&self, name: &str) -> Option<&Scalar> {
        self.base.constant(name)
    }

    /// Follows alias declarations to the underlying base type.
    ///
    /// Unknown names resolve to themselves; alias chains are bounded
    /// so a mis-declared alias loop cannot hang resolution.
    #[must_use]
    pub fn base_type(&self, name: &QualifiedName) -> QualifiedName {
        let mut current = name.clone();
        // Alias chains deeper than this indicate a declaration loop.
        for _ in 0..32 {
            match self.type_def(&current).map(|d| &d.kind) {
                Some(TypeKind::Alias { target }) => current = target.clone(),
                _ => return current,
            }
        }
        current
    }

    /// Returns true when a value of type `from` can satisfy a request
    /// for type `to`, honoring alias equivalence and collection
    /// member compatibility.
    #[must_use]
    pub fn is_assignable(&self, from: &QualifiedName, to: &QualifiedName) -> bool {
        let from_base = self.base_type(from);
        let to_base = self.base_type(to);
        if from_base == to_base {
            return true;
        }
        match (
            self.type_def(&from_base).map(|d| &d.kind),
            self.type_def(&to_base).map(|d| &d.kind),
        ) {
            (
                Some(TypeKind::Collection { member: from_member }),
                Some(TypeKind::Collection { member: to_member }),
            ) => self.base_type(from_member) == self.base_type(to_member),
            _ => false,
        }
    }

    /// Returns the exact (alias-resolved) equality of two type names.
    #[must_use]
    pub fn is_exact(&self, a: &QualifiedName, b: &QualifiedName) -> bool {
        self.base_type(a) == self.base_type(b)
    }

    /// If the name (after alias resolution) is a collection type,
    /// returns its member type.
    #[must_use]
    pub fn collection_member(&self, name: &QualifiedName) -> Option<QualifiedName> {
        let base = self.base_type(name);
        match self.type_def(&base).map(|d| &d.kind) {
            Some(TypeKind::Collection { member }) => Some(member.clone()),
            _ => None,
        }
    }
}

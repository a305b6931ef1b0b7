//! Typed values and their provenance.
//!
//! Every value flowing through the engine is a [`TypedInstance`]: a
//! scalar, object, collection, or typed null tagged with its declared
//! schema type and a [`Provenance`] recording where it came from.
//! Instances serialize as tagged JSON, which is also the wire form
//! used by the result cache.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::QualifiedName;

/// A primitive value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    /// A boolean.
    Bool(bool),
    /// A 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string. ISO dates are carried as strings and compare
    /// lexically, which matches their chronological order.
    String(String),
}

impl Scalar {
    /// Returns true if this is a boolean.
    #[must_use]
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Returns the boolean value, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the integer value, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the numeric value, widening integers.
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the string value, if any.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Compares two scalars where comparison is meaningful: same
    /// variant, or int/float cross-comparison. Returns `None` for
    /// incomparable pairs.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_float()?;
                let b = other.as_float()?;
                a.partial_cmp(&b)
            }
        }
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Where a value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the caller alongside the query.
    Provided,
    /// Declared as a constant in the schema.
    DefinedInSchema,
    /// Computed locally from other resolved values.
    Derived {
        /// The operand types the derivation consumed.
        operands: Vec<QualifiedName>,
    },
    /// Emitted by an actual remote invocation.
    RemoteCall {
        /// The qualified operation name.
        operation: String,
        /// The query that performed the invocation.
        query_id: Uuid,
    },
    /// Replayed from the shared result cache.
    CacheReplay {
        /// The operation whose result was cached.
        operation: String,
        /// The query performing the replay, not the original writer.
        query_id: Uuid,
    },
}

/// The value payload of a [`TypedInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum InstanceValue {
    /// A typed absence of value.
    Null,
    /// A primitive value.
    Scalar {
        /// The payload.
        scalar: Scalar,
    },
    /// Named, typed attributes.
    Object {
        /// Attribute name to attribute instance, in declaration order.
        attributes: Vec<(String, TypedInstance)>,
    },
    /// An ordered collection of member instances.
    Collection {
        /// The members.
        items: Vec<TypedInstance>,
    },
}

/// A value tagged with its declared schema type and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedInstance {
    /// The declared type. Must be resolvable in the active schema.
    pub type_name: QualifiedName,
    /// The value payload.
    pub value: InstanceValue,
    /// Where the value came from.
    pub provenance: Provenance,
}

impl TypedInstance {
    /// Creates a scalar instance.
    pub fn scalar(
        type_name: impl Into<QualifiedName>,
        scalar: impl Into<Scalar>,
        provenance: Provenance,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            value: InstanceValue::Scalar {
                scalar: scalar.into(),
            },
            provenance,
        }
    }

    /// Creates an object instance.
    pub fn object(
        type_name: impl Into<QualifiedName>,
        attributes: Vec<(String, TypedInstance)>,
        provenance: Provenance,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            value: InstanceValue::Object { attributes },
            provenance,
        }
    }

    /// Creates a collection instance.
    pub fn collection(
        type_name: impl Into<QualifiedName>,
        items: Vec<TypedInstance>,
        provenance: Provenance,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            value: InstanceValue::Collection { items },
            provenance,
        }
    }

    /// Creates a type-preserving null: the declared type is retained
    /// while the value is absent.
    pub fn typed_null(type_name: impl Into<QualifiedName>, provenance: Provenance) -> Self {
        Self {
            type_name: type_name.into(),
            value: InstanceValue::Null,
            provenance,
        }
    }

    /// Returns true if the value is a typed null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self.value, InstanceValue::Null)
    }

    /// Returns the scalar payload, if any.
    #[must_use]
    pub const fn as_scalar(&self) -> Option<&Scalar> {
        match &self.value {
            InstanceValue::Scalar { scalar } => Some(scalar),
            _ => None,
        }
    }

    /// Returns the collection items, if any.
    #[must_use]
    pub fn as_collection(&self) -> Option<&[TypedInstance]> {
        match &self.value {
            InstanceValue::Collection { items } => Some(items),
            _ => None,
        }
    }

    /// Looks up an attribute by name on an object instance.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&TypedInstance> {
        match &self.value {
            InstanceValue::Object { attributes } => attributes
                .iter()
                .find(|(attr, _)| attr == name)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Iterates over the attributes of an object instance.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &TypedInstance)> {
        let attrs = match &self.value {
            InstanceValue::Object { attributes } => attributes.as_slice(),
            _ => &[],
        };
        attrs.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Replaces the named attributes of an object with typed nulls of
    /// their declared types, leaving all other attributes untouched.
    /// Non-object values are returned unchanged.
    #[must_use]
    pub fn mask_attributes(&self, names: &[String]) -> Self {
        let InstanceValue::Object { attributes } = &self.value else {
            return self.clone();
        };
        let masked = attributes
            .iter()
            .map(|(attr, value)| {
                if names.iter().any(|n| n == attr) {
                    (
                        attr.clone(),
                        Self::typed_null(value.type_name.clone(), value.provenance.clone()),
                    )
                } else {
                    (attr.clone(), value.clone())
                }
            })
            .collect();
        Self {
            type_name: self.type_name.clone(),
            value: InstanceValue::Object { attributes: masked },
            provenance: self.provenance.clone(),
        }
    }

    /// Rewrites the provenance of this instance and every nested
    /// value. Used when replaying cached values, whose recorded
    /// provenance points at the original writer's query.
    #[must_use]
    pub fn with_provenance(&self, provenance: &Provenance) -> Self {
        let value = match &self.value {
            InstanceValue::Null => InstanceValue::Null,
            InstanceValue::Scalar { scalar } => InstanceValue::Scalar {
                scalar: scalar.clone(),
            },
            InstanceValue::Object { attributes } => InstanceValue::Object {
                attributes: attributes
                    .iter()
                    .map(|(n, v)| (n.clone(), v.with_provenance(provenance)))
                    .collect(),
            },
            InstanceValue::Collection { items } => InstanceValue::Collection {
                items: items.iter().map(|v| v.with_provenance(provenance)).collect(),
            },
        };
        Self {
            type_name: self.type_name.clone(),
            value,
            provenance: provenance.clone(),
        }
    }
}

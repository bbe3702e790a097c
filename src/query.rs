//! Query descriptors.
//!
//! A query is a descriptor, not a language: it names rows either by table
//! (optionally filtered by a field predicate) or by walking a child list
//! owned by a parent object. Evaluation lives in the engine and always
//! targets one specific version.

use crate::types::{FieldValue, ObjectData, ObjectId};
use serde::{Deserialize, Serialize};

/// Field predicate applied to candidate rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Field equals the value. Missing fields never match.
    Eq(String, FieldValue),
    /// Field differs from the value. Missing fields match.
    Ne(String, FieldValue),
    /// Integer field is strictly greater than the value.
    Gt(String, i64),
    /// Integer field is strictly less than the value.
    Lt(String, i64),
    /// String field contains the substring.
    Contains(String, String),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Ne(field.into(), value.into())
    }

    pub(crate) fn matches(&self, data: &ObjectData) -> bool {
        match self {
            Predicate::Eq(field, value) => data.get(field) == Some(value),
            Predicate::Ne(field, value) => data.get(field) != Some(value),
            Predicate::Gt(field, bound) => {
                matches!(data.get(field), Some(FieldValue::Int(i)) if i > bound)
            }
            Predicate::Lt(field, bound) => {
                matches!(data.get(field), Some(FieldValue::Int(i)) if i < bound)
            }
            Predicate::Contains(field, needle) => {
                matches!(data.get(field), Some(FieldValue::Str(s)) if s.contains(needle))
            }
        }
    }
}

/// Where candidate rows come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QuerySource {
    /// All rows of a table, in row-id order.
    Table(String),
    /// The rows referenced by a link-list field of one parent object, in
    /// list order. Deleting the parent invalidates results derived from
    /// this source.
    ChildList {
        parent_table: String,
        parent: ObjectId,
        field: String,
    },
}

/// A live-evaluable query descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub source: QuerySource,
    pub predicate: Option<Predicate>,
}

impl Query {
    /// All rows of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            source: QuerySource::Table(table.into()),
            predicate: None,
        }
    }

    /// The child list held in `field` of the given parent row.
    pub fn child_list(
        parent_table: impl Into<String>,
        parent: ObjectId,
        field: impl Into<String>,
    ) -> Self {
        Self {
            source: QuerySource::ChildList {
                parent_table: parent_table.into(),
                parent,
                field: field.into(),
            },
            predicate: None,
        }
    }

    /// Restrict the query with a predicate.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

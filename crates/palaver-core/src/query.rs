//! Channel-list query specifications.
//!
//! A query is a (filter, sort) pair.  Its identity is a deterministic blake3
//! hash over the canonical JSON encoding, so semantically identical queries
//! share one persisted record no matter where they were constructed.

use serde::{Deserialize, Serialize};

use crate::types::Cid;

/// Opaque channel filter, sent to the server verbatim.
///
/// `serde_json`'s map type keeps keys sorted, which is what makes the
/// canonical encoding (and therefore the spec id) deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterObject(pub serde_json::Value);

impl FilterObject {
    /// `{field: {"$eq": value}}`
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::operator(field, "$eq", value.into())
    }

    /// `{field: {"$in": values}}`
    pub fn in_list<V: Into<serde_json::Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values: Vec<serde_json::Value> = values.into_iter().map(Into::into).collect();
        Self::operator(field, "$in", serde_json::Value::Array(values))
    }

    fn operator(field: impl Into<String>, op: &str, value: serde_json::Value) -> Self {
        let mut inner = serde_json::Map::new();
        inner.insert(op.to_string(), value);
        let mut outer = serde_json::Map::new();
        outer.insert(field.into(), serde_json::Value::Object(inner));
        Self(serde_json::Value::Object(outer))
    }
}

/// Sort order of one field.  `value()` yields the wire encoding
/// (+1 ascending, -1 descending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn value(self) -> i64 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// One (field, direction) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Ordered list of sort specs applied to channel-list queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuerySort {
    pub fields: Vec<SortSpec>,
}

impl QuerySort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(SortSpec {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(SortSpec {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }
}

/// A saved channel-list query and the cids it currently resolves to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryChannelsSpec {
    /// Deterministic identity derived from (filter, sort).
    pub id: String,
    pub filter: FilterObject,
    pub sort: QuerySort,
    pub cids: Vec<Cid>,
}

impl QueryChannelsSpec {
    pub fn new(filter: FilterObject, sort: QuerySort) -> Self {
        let id = spec_id(&filter, &sort);
        Self {
            id,
            filter,
            sort,
            cids: Vec::new(),
        }
    }
}

/// Hash (filter, sort) into the spec identity.
fn spec_id(filter: &FilterObject, sort: &QuerySort) -> String {
    #[derive(Serialize)]
    struct Identity<'a> {
        filter: &'a FilterObject,
        sort: &'a QuerySort,
    }

    // Serialization of these types cannot fail.
    let bytes = serde_json::to_vec(&Identity { filter, sort }).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_filter_and_sort_share_an_id() {
        let a = QueryChannelsSpec::new(FilterObject::eq("type", "messaging"), QuerySort::new());
        let b = QueryChannelsSpec::new(FilterObject::eq("type", "messaging"), QuerySort::new());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn sort_changes_the_id() {
        let filter = FilterObject::eq("type", "messaging");
        let unsorted = QueryChannelsSpec::new(filter.clone(), QuerySort::new());
        let sorted = QueryChannelsSpec::new(filter, QuerySort::new().desc("last_message_at"));
        assert_ne!(unsorted.id, sorted.id);
    }

    #[test]
    fn sort_field_order_matters() {
        let filter = FilterObject::eq("type", "messaging");
        let a = QueryChannelsSpec::new(
            filter.clone(),
            QuerySort::new().asc("name").desc("last_message_at"),
        );
        let b = QueryChannelsSpec::new(
            filter,
            QuerySort::new().desc("last_message_at").asc("name"),
        );
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn filter_key_order_is_canonical() {
        let a = FilterObject(serde_json::json!({"type": "messaging", "muted": false}));
        let b = FilterObject(serde_json::json!({"muted": false, "type": "messaging"}));
        let spec_a = QueryChannelsSpec::new(a, QuerySort::new());
        let spec_b = QueryChannelsSpec::new(b, QuerySort::new());
        assert_eq!(spec_a.id, spec_b.id);
    }

    #[test]
    fn in_list_filter_shape() {
        let filter = FilterObject::in_list("cid", ["messaging:a", "messaging:b"]);
        assert_eq!(
            filter.0,
            serde_json::json!({"cid": {"$in": ["messaging:a", "messaging:b"]}})
        );
    }
}

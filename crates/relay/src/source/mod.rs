//! Upstream sources of records: S3 batch files and the Athena date partition.
//!
//! # Responsibilities
//!
//! - Enumerate S3 batch files oldest-first and read each one as a [`SourceUnit`].
//! - Query one date partition of the analytical table as a single [`SourceUnit`].
//! - Decode a unit into [`Record`]s in decode order.
//!
//! # Module invariants
//!
//! - **No crypto or broker dependencies.** Nothing here may import
//!   `crate::crypto`, `crate::key` or `crate::broker`.
//! - Collaborator handles are read-only and reused across all units.

pub mod object_store;
pub mod record;
pub mod table;

pub use object_store::{ObjectStore, S3ObjectStore};
pub use record::{OrderKey, Record};
pub use table::{AthenaTableEngine, PartitionPredicate, TableEngine, TableRef};

#[cfg(test)]
pub use object_store::MockObjectStore;
#[cfg(test)]
pub use table::MockTableEngine;

use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

/// A JSON object: one table row or one decoded batch-file entry.
pub type Row = Map<String, Value>;

/// Errors from the upstream collaborators.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The object store or table engine could not be reached, or refused.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The unit's bytes are not a JSON object stream.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Which collaborator a unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOrigin {
    /// An S3 batch file.
    ObjectStore,
    /// A date partition of the analytical table.
    Table,
}

impl UnitOrigin {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            UnitOrigin::ObjectStore => "object_store",
            UnitOrigin::Table => "table",
        }
    }
}

/// The content of a unit before decoding.
#[derive(Debug, Clone)]
pub enum UnitBody {
    /// Raw bytes of a JSON batch file.
    Encoded(Bytes),
    /// Rows already materialised by the table engine.
    Rows(Vec<Row>),
}

/// One retrievable batch of records, consumed once.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Identifier used in logs and the replay list (S3 key or query description).
    pub id: String,
    /// Collaborator the unit came from.
    pub origin: UnitOrigin,
    /// Group key to use for records that carry none of their own.
    pub group_hint: Option<String>,
    /// Undecoded content.
    pub body: UnitBody,
}

impl SourceUnit {
    /// Decode the unit into records, preserving decode order in
    /// [`Record::position`].
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Decode`] if an encoded body is not valid JSON
    /// or contains something other than objects.
    pub fn decode(self) -> Result<Vec<Record>, SourceError> {
        let rows = match self.body {
            UnitBody::Rows(rows) => rows,
            UnitBody::Encoded(bytes) => decode_json_objects(&bytes)?,
        };
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(position, fields)| Record::new(position, fields))
            .collect())
    }
}

/// Decode a JSON array of objects, a single object, or a whitespace/newline
/// separated stream of objects. An empty body yields no rows.
fn decode_json_objects(bytes: &[u8]) -> Result<Vec<Row>, SourceError> {
    let values = serde_json::Deserializer::from_slice(bytes)
        .into_iter::<Value>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SourceError::Decode(e.to_string()))?;

    let values = match <[Value; 1]>::try_from(values) {
        Ok([Value::Array(items)]) => items,
        Ok([single]) => vec![single],
        Err(values) => values,
    };

    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Object(map) => Ok(map),
            other => Err(SourceError::Decode(format!(
                "entry {i} is a {}, expected an object",
                json_kind(&other)
            ))),
        })
        .collect()
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

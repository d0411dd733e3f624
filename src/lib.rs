pub mod batcher;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod merger;
pub mod query_executor;
pub mod query_model;
pub mod query_planner;
pub mod service_registry;
pub mod swapi;
pub mod transport;

pub use config::{FailurePolicy, GatewayConfig, ResolverConfig};
pub use error::{ErrorKind, ErrorMarker, FetchError, FetchResult, TransportError};
pub use gateway::{Gateway, PreparedQuery};
pub use query_model::{FieldNode, FieldSelection, QueryRequest, parse, parse_str};
pub use service_registry::{ServiceDescriptor, ServiceRegistry};
pub use transport::{HttpTransport, InMemoryTransport, Transport};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use query_model::Arguments;

/// Identifies one concrete entity owned by a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub service: String,
    pub entity_type: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(
        service: impl Into<String>,
        entity_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        EntityRef {
            service: service.into(),
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

/// A resolved entity: its scalar values plus the ref that roots the next depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: EntityRef,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// One outbound call covering every ref of a resolution group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// Unique parent refs in first-seen order; empty for root operations.
    #[serde(default)]
    pub ids: Vec<EntityRef>,
    #[serde(with = "selection_literal")]
    pub selection: Vec<FieldSelection>,
}

/// Related records for one parent ref, in the service's order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedEntities {
    pub parent: EntityRef,
    pub records: Vec<EntityRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Entities produced by a root operation.
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    /// Scalar outputs of a root operation.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Related entities per parent for a relation batch.
    #[serde(default)]
    pub related: Vec<RelatedEntities>,
}

impl BatchResponse {
    /// Indexes `related` by parent ref.
    pub fn related_by_parent(&self) -> HashMap<&EntityRef, &[EntityRecord]> {
        self.related
            .iter()
            .map(|entry| (&entry.parent, entry.records.as_slice()))
            .collect()
    }
}

mod selection_literal {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    use crate::query_model::{FieldSelection, parse_selection, to_literal};

    pub fn serialize<S: Serializer>(
        selection: &[FieldSelection],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        to_literal(selection).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<FieldSelection>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_selection(&value).map_err(D::Error::custom)
    }
}

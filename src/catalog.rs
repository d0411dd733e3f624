//! In-process entity catalog and the transport that serves it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FetchError, FetchResult, TransportError};
use crate::query_model::FieldSelection;
use crate::service_registry::{Cardinality, ServiceRegistry};
use crate::transport::Transport;
use crate::{BatchRequest, BatchResponse, EntityRecord, EntityRef, RelatedEntities};

#[derive(Clone, Debug)]
struct StoredEntity {
    id: String,
    fields: Map<String, Value>,
    /// Related ids per relation name, in stored order.
    links: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default)]
struct EntityTable {
    service: String,
    rows: Vec<StoredEntity>,
    index: HashMap<String, usize>,
}

impl EntityTable {
    fn get(&self, id: &str) -> Option<&StoredEntity> {
        self.index.get(id).map(|&i| &self.rows[i])
    }

    fn get_all(&self, ids: &[String]) -> Result<Vec<&StoredEntity>, String> {
        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| !self.index.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("unknown ids: {:?}", missing));
        }
        Ok(ids.iter().filter_map(|id| self.get(id)).collect())
    }
}

/// Entity records keyed by type, with relation links split out of the rows
/// according to the registry.
#[derive(Clone, Debug)]
pub struct Catalog {
    registry: Arc<ServiceRegistry>,
    tables: HashMap<String, EntityTable>,
}

impl Catalog {
    /// Loads rows shaped as `{ "Film": [ { "id": "1", "title": .., "characters": ["1"] } ] }`.
    pub fn from_json(registry: Arc<ServiceRegistry>, data: &Value) -> FetchResult<Catalog> {
        let types = data
            .as_object()
            .ok_or_else(|| FetchError::config("catalog data must be an object"))?;
        let mut tables = HashMap::new();

        for (entity_type, rows) in types {
            let binding = registry.entity(entity_type).ok_or_else(|| {
                FetchError::config(format!("catalog type '{}' is not registered", entity_type))
            })?;
            let rows = rows.as_array().ok_or_else(|| {
                FetchError::config(format!("rows of '{}' must be an array", entity_type))
            })?;

            let mut table = EntityTable {
                service: binding.service.clone(),
                ..Default::default()
            };
            for row in rows {
                let entity = split_row(&registry, entity_type, row)?;
                table.index.insert(entity.id.clone(), table.rows.len());
                table.rows.push(entity);
            }
            tables.insert(entity_type.clone(), table);
        }

        Ok(Catalog { registry, tables })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn len(&self, entity_type: &str) -> usize {
        self.tables.get(entity_type).map_or(0, |table| table.rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|table| table.rows.is_empty())
    }

    fn table(&self, entity_type: &str) -> Option<&EntityTable> {
        self.tables.get(entity_type)
    }

    fn record(
        &self,
        table: &EntityTable,
        entity_type: &str,
        stored: &StoredEntity,
        selection: &[FieldSelection],
    ) -> EntityRecord {
        let fields = selection
            .iter()
            .filter(|field| !field.is_relation())
            .filter_map(|field| {
                stored
                    .fields
                    .get(&field.name)
                    .map(|value| (field.name.clone(), value.clone()))
            })
            .collect();
        EntityRecord {
            entity: EntityRef::new(&table.service, entity_type, &stored.id),
            fields,
        }
    }
}

fn split_row(registry: &ServiceRegistry, entity_type: &str, row: &Value) -> FetchResult<StoredEntity> {
    let object = row
        .as_object()
        .ok_or_else(|| FetchError::config(format!("a '{}' row must be an object", entity_type)))?;
    let id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::config(format!("a '{}' row has no string id", entity_type)))?
        .to_string();

    let mut fields = Map::new();
    let mut links = HashMap::new();
    for (key, value) in object {
        let Some(relation) = registry.relation(entity_type, key) else {
            fields.insert(key.clone(), value.clone());
            continue;
        };
        let ids = match (relation.descriptor.cardinality, value) {
            (_, Value::Null) => Vec::new(),
            (Cardinality::One, Value::String(id)) => vec![id.clone()],
            (Cardinality::Many, Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => {
                return Err(FetchError::config(format!(
                    "link '{}.{}' of row '{}' has the wrong shape",
                    entity_type, key, id
                )));
            }
        };
        links.insert(key.clone(), ids);
    }

    Ok(StoredEntity { id, fields, links })
}

/// Serves batch requests from a [`Catalog`] without leaving the process.
///
/// Root operations take either `ids` (every id must exist) or the paging
/// arguments `page_size` and `page_token`. Relations truncate each parent's
/// related ids to `limit` before looking them up.
#[derive(Clone)]
pub struct InMemoryTransport {
    catalog: Arc<Catalog>,
}

impl InMemoryTransport {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        InMemoryTransport { catalog }
    }

    fn serve_operation(
        &self,
        request: &BatchRequest,
        entity_type: &str,
        scalars: &[String],
    ) -> Result<BatchResponse, String> {
        let table = self
            .catalog
            .table(entity_type)
            .ok_or_else(|| format!("no rows for '{}'", entity_type))?;

        let mut outputs = Map::new();
        let rows: Vec<&StoredEntity> = match request.arguments.get("ids") {
            Some(Value::Array(ids)) => {
                let ids: Vec<String> = ids
                    .iter()
                    .map(|id| id.as_str().map(str::to_string))
                    .collect::<Option<_>>()
                    .ok_or_else(|| "ids must be an array of strings".to_string())?;
                table.get_all(&ids)?
            }
            Some(_) => return Err("ids must be an array of strings".to_string()),
            None => {
                let (page, next_page_token) = paginate(
                    &table.rows,
                    request.arguments.get("page_size").and_then(Value::as_u64),
                    request.arguments.get("page_token").and_then(Value::as_str),
                );
                if scalars.iter().any(|name| name == "next_page_token") {
                    outputs.insert("next_page_token".to_string(), Value::from(next_page_token));
                }
                page.iter().collect()
            }
        };

        Ok(BatchResponse {
            entities: rows
                .into_iter()
                .map(|row| {
                    self.catalog
                        .record(table, entity_type, row, &request.selection)
                })
                .collect(),
            outputs,
            related: Vec::new(),
        })
    }

    fn serve_relation(&self, request: &BatchRequest) -> Result<BatchResponse, String> {
        let registry = self.catalog.registry();
        let relation = registry
            .relation_by_operation(&request.operation)
            .ok_or_else(|| format!("unimplemented operation '{}'", request.operation))?;
        if relation.service != request.service {
            return Err(format!(
                "'{}' is resolved by '{}'",
                request.operation, relation.service
            ));
        }
        let descriptor = &relation.descriptor;
        let parents = self
            .catalog
            .table(&descriptor.parent_type)
            .ok_or_else(|| format!("no rows for '{}'", descriptor.parent_type))?;
        let targets = self
            .catalog
            .table(&descriptor.target_type)
            .ok_or_else(|| format!("no rows for '{}'", descriptor.target_type))?;
        let limit = request
            .arguments
            .get("limit")
            .and_then(Value::as_u64)
            .filter(|&limit| limit > 0)
            .map(|limit| limit as usize);

        let mut related = Vec::with_capacity(request.ids.len());
        for parent in &request.ids {
            let stored = parents
                .get(&parent.id)
                .ok_or_else(|| format!("unknown {} id '{}'", descriptor.parent_type, parent.id))?;
            let mut ids = stored
                .links
                .get(&descriptor.name)
                .cloned()
                .unwrap_or_default();
            if let Some(limit) = limit {
                ids.truncate(limit);
            }
            let records = targets
                .get_all(&ids)?
                .into_iter()
                .map(|row| {
                    self.catalog
                        .record(targets, &descriptor.target_type, row, &request.selection)
                })
                .collect();
            related.push(RelatedEntities {
                parent: parent.clone(),
                records,
            });
        }

        Ok(BatchResponse {
            related,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, request: BatchRequest) -> Result<BatchResponse, TransportError> {
        let registry = self.catalog.registry();
        let result = match registry.operation(&request.service, &request.operation) {
            Some(binding) => self.serve_operation(
                &request,
                &binding.descriptor.entity_type,
                &binding.descriptor.scalars,
            ),
            None => self.serve_relation(&request),
        };
        result.map_err(|message| TransportError::new(&request.service, &request.operation, message))
    }
}

/// Returns the page starting at `page_token` and the token of the next page
/// (empty when the page reaches the end).
fn paginate<'a, T>(
    rows: &'a [T],
    page_size: Option<u64>,
    page_token: Option<&str>,
) -> (&'a [T], String) {
    let start = page_token
        .and_then(|token| token.parse::<usize>().ok())
        .unwrap_or(0)
        .min(rows.len());
    let size = match page_size {
        Some(size) if size > 0 => size as usize,
        _ => rows.len(),
    };
    let end = start.saturating_add(size).min(rows.len());
    let next = if end < rows.len() {
        end.to_string()
    } else {
        String::new()
    };
    (&rows[start..end], next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapi;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(service: &str, operation: &str, arguments: Value, ids: Vec<EntityRef>) -> BatchRequest {
        BatchRequest {
            service: service.to_string(),
            operation: operation.to_string(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            ids,
            selection: vec![FieldSelection::scalar("name"), FieldSelection::scalar("title")],
        }
    }

    #[test]
    fn paginate_walks_pages() {
        let rows = [1, 2, 3, 4, 5];
        assert_eq!(paginate(&rows, Some(2), None), (&rows[0..2], "2".to_string()));
        assert_eq!(paginate(&rows, Some(2), Some("4")), (&rows[4..5], String::new()));
        assert_eq!(paginate(&rows, None, None), (&rows[..], String::new()));
        assert_eq!(paginate(&rows, Some(2), Some("9")), (&rows[5..5], String::new()));
    }

    #[tokio::test]
    async fn get_by_ids_keeps_request_order_and_rejects_unknown_ids() {
        let transport = swapi::transport().unwrap();
        let response = transport
            .send(request("film.v1.FilmService", "getFilms", json!({ "ids": ["3", "1"] }), vec![]))
            .await
            .unwrap();
        let ids: Vec<&str> = response.entities.iter().map(|r| r.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
        assert_eq!(response.entities[1].fields["title"], json!("A New Hope"));
        assert!(!response.entities[1].fields.contains_key("director"));

        let err = transport
            .send(request("film.v1.FilmService", "getFilms", json!({ "ids": ["99"] }), vec![]))
            .await
            .unwrap_err();
        assert!(err.message.contains("99"));
    }

    #[tokio::test]
    async fn non_string_ids_are_rejected() {
        let transport = swapi::transport().unwrap();
        let err = transport
            .send(request("film.v1.FilmService", "getFilms", json!({ "ids": ["1", 2] }), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.message, "ids must be an array of strings");
    }

    #[tokio::test]
    async fn relation_truncates_links_before_lookup() {
        let transport = swapi::transport().unwrap();
        let response = transport
            .send(request(
                "person.v1.PersonService",
                "Film.characters",
                json!({ "limit": 2 }),
                vec![EntityRef::new("film.v1.FilmService", "Film", "1")],
            ))
            .await
            .unwrap();
        let names: Vec<&Value> = response.related[0]
            .records
            .iter()
            .map(|r| &r.fields["name"])
            .collect();
        assert_eq!(names, vec![&json!("Luke Skywalker"), &json!("C-3PO")]);
    }

    #[tokio::test]
    async fn list_reports_next_page_token() {
        let transport = swapi::transport().unwrap();
        let response = transport
            .send(request("film.v1.FilmService", "listFilms", json!({ "page_size": 2 }), vec![]))
            .await
            .unwrap();
        assert_eq!(response.entities.len(), 2);
        assert_eq!(response.outputs["next_page_token"], json!("2"));
    }
}

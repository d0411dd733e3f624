use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::query_model::{FieldNode, FieldSelection, OperationRequest, QueryRequest};

/// Declares what one service exposes: the entity types it owns, its root
/// operations, and the relations it resolves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    /// Entity type listed under `output`.
    pub entity_type: String,
    /// Response field holding the entity list, e.g. `films`.
    pub output: String,
    /// Scalar response fields next to the entity list, e.g. `next_page_token`.
    #[serde(default)]
    pub scalars: Vec<String>,
    #[serde(default = "default_true")]
    pub accepts_arguments: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub parent_type: String,
    pub name: String,
    pub target_type: String,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub default_limit: Option<usize>,
    #[serde(default)]
    pub max_limit: Option<usize>,
}

impl RelationDescriptor {
    /// Operation identifier under which the resolving service handles this relation.
    pub fn operation_id(&self) -> String {
        format!("{}.{}", self.parent_type, self.name)
    }

    pub fn accepts_arguments(&self) -> bool {
        self.cardinality == Cardinality::Many
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct OperationBinding {
    pub service: String,
    pub descriptor: OperationDescriptor,
}

#[derive(Clone, Debug)]
pub struct RelationBinding {
    /// Service that resolves the relation.
    pub service: String,
    pub operation: String,
    pub descriptor: RelationDescriptor,
}

#[derive(Clone, Debug)]
pub struct EntityBinding {
    pub service: String,
    pub fields: HashSet<String>,
}

/// Immutable dispatch table composed from service descriptors.
///
/// Lookups take `&self` only; share it across executions behind an `Arc`.
#[derive(Clone, Debug, Default)]
pub struct ServiceRegistry {
    operations: HashMap<String, OperationBinding>,
    relations: HashMap<String, RelationBinding>,
    entities: HashMap<String, EntityBinding>,
    services: Vec<String>,
}

impl ServiceRegistry {
    /// Composes descriptors into a registry, failing on any ambiguous entry.
    pub fn compose(
        descriptors: impl IntoIterator<Item = ServiceDescriptor>,
    ) -> FetchResult<ServiceRegistry> {
        let mut registry = ServiceRegistry::default();
        // Operation identifier -> registering service, across both kinds.
        let mut owners: HashMap<String, String> = HashMap::new();

        for descriptor in descriptors {
            registry.services.push(descriptor.name.clone());

            for entity in descriptor.entities {
                if let Some(existing) = registry.entities.get(&entity.name) {
                    return Err(FetchError::DuplicateEntity {
                        entity_type: entity.name,
                        first: existing.service.clone(),
                        second: descriptor.name.clone(),
                    });
                }
                registry.entities.insert(
                    entity.name,
                    EntityBinding {
                        service: descriptor.name.clone(),
                        fields: entity.fields.into_iter().collect(),
                    },
                );
            }

            for operation in descriptor.operations {
                let id = format!("{}/{}", descriptor.name, operation.name);
                claim(&mut owners, &id, &descriptor.name)?;
                registry.operations.insert(
                    id,
                    OperationBinding {
                        service: descriptor.name.clone(),
                        descriptor: operation,
                    },
                );
            }

            for relation in descriptor.relations {
                let id = relation.operation_id();
                claim(&mut owners, &id, &descriptor.name)?;
                registry.relations.insert(
                    id.clone(),
                    RelationBinding {
                        service: descriptor.name.clone(),
                        operation: id,
                        descriptor: relation,
                    },
                );
            }
        }

        registry.check_entity_types()?;
        debug!(
            services = registry.services.len(),
            operations = registry.operations.len(),
            relations = registry.relations.len(),
            "composed service registry"
        );
        Ok(registry)
    }

    fn check_entity_types(&self) -> FetchResult<()> {
        for relation in self.relations.values() {
            for entity_type in [
                &relation.descriptor.parent_type,
                &relation.descriptor.target_type,
            ] {
                if !self.entities.contains_key(entity_type) {
                    return Err(FetchError::UnknownEntityType {
                        relation: relation.operation.clone(),
                        entity_type: entity_type.clone(),
                    });
                }
            }
        }
        for operation in self.operations.values() {
            if !self.entities.contains_key(&operation.descriptor.entity_type) {
                return Err(FetchError::UnknownEntityType {
                    relation: format!("{}/{}", operation.service, operation.descriptor.name),
                    entity_type: operation.descriptor.entity_type.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn operation(&self, service: &str, operation: &str) -> Option<&OperationBinding> {
        self.operations.get(&format!("{}/{}", service, operation))
    }

    pub fn relation(&self, parent_type: &str, name: &str) -> Option<&RelationBinding> {
        self.relations.get(&format!("{}.{}", parent_type, name))
    }

    /// Looks a relation up by its operation identifier, e.g. `Film.characters`.
    pub fn relation_by_operation(&self, operation: &str) -> Option<&RelationBinding> {
        self.relations.get(operation)
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityBinding> {
        self.entities.get(entity_type)
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Checks a parsed request against the declared schema.
    pub fn validate(&self, request: &QueryRequest) -> FetchResult<()> {
        for op in &request.operations {
            self.validate_operation(op)?;
        }
        Ok(())
    }

    fn validate_operation(&self, op: &OperationRequest) -> FetchResult<()> {
        let path = format!("{}/{}", op.service, op.operation);
        let binding =
            self.operation(&op.service, &op.operation)
                .ok_or_else(|| FetchError::UnknownOperation {
                    service: op.service.clone(),
                    operation: op.operation.clone(),
                })?;
        let descriptor = &binding.descriptor;

        if !descriptor.accepts_arguments && !op.arguments.is_empty() {
            return Err(FetchError::parse(path, "operation does not accept arguments"));
        }

        for field in &op.selection {
            let field_path = format!("{}.{}", path, field.name);
            if field.name == descriptor.output {
                match &field.node {
                    FieldNode::Relation {
                        arguments,
                        children,
                    } => {
                        if !arguments.is_empty() {
                            return Err(FetchError::parse(
                                field_path,
                                "an operation output does not accept arguments",
                            ));
                        }
                        self.validate_selection(&descriptor.entity_type, children, &field_path)?;
                    }
                    FieldNode::Scalar => {
                        return Err(FetchError::parse(
                            field_path,
                            "relation field has no sub-selection",
                        ));
                    }
                }
            } else if descriptor.scalars.contains(&field.name) {
                if field.is_relation() {
                    return Err(FetchError::parse(
                        field_path,
                        "scalar field cannot have a sub-selection",
                    ));
                }
            } else {
                return Err(FetchError::UnknownField {
                    entity_type: format!("{}Response", descriptor.name),
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn validate_selection(
        &self,
        entity_type: &str,
        selection: &[FieldSelection],
        path: &str,
    ) -> FetchResult<()> {
        let entity = self
            .entity(entity_type)
            .ok_or_else(|| FetchError::UnknownEntityType {
                relation: path.to_string(),
                entity_type: entity_type.to_string(),
            })?;

        for field in selection {
            let field_path = format!("{}.{}", path, field.name);
            if let Some(relation) = self.relation(entity_type, &field.name) {
                let FieldNode::Relation {
                    arguments,
                    children,
                } = &field.node
                else {
                    return Err(FetchError::parse(
                        field_path,
                        "relation field has no sub-selection",
                    ));
                };
                validate_relation_arguments(relation, field, arguments, &field_path)?;
                self.validate_selection(&relation.descriptor.target_type, children, &field_path)?;
            } else if entity.fields.contains(&field.name) {
                if field.is_relation() {
                    return Err(FetchError::parse(
                        field_path,
                        "scalar field cannot have a sub-selection",
                    ));
                }
            } else {
                return Err(FetchError::UnknownField {
                    entity_type: entity_type.to_string(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn claim(owners: &mut HashMap<String, String>, id: &str, service: &str) -> FetchResult<()> {
    if let Some(first) = owners.get(id) {
        return Err(FetchError::DuplicateOperation {
            operation: id.to_string(),
            first: first.clone(),
            second: service.to_string(),
        });
    }
    owners.insert(id.to_string(), service.to_string());
    Ok(())
}

fn validate_relation_arguments(
    relation: &RelationBinding,
    field: &FieldSelection,
    arguments: &crate::query_model::Arguments,
    path: &str,
) -> FetchResult<()> {
    if arguments.is_empty() {
        return Ok(());
    }
    if !relation.descriptor.accepts_arguments() {
        return Err(FetchError::parse(path, "relation does not accept arguments"));
    }
    if let Some(limit) = arguments.get("limit") {
        if !limit.is_u64() {
            return Err(FetchError::parse(
                path,
                "limit must be a non-negative integer",
            ));
        }
    }
    if let (Some(requested), Some(max)) = (field.limit(), relation.descriptor.max_limit) {
        if requested > max {
            return Err(FetchError::LimitExceeded {
                relation: relation.operation.clone(),
                requested,
                max,
            });
        }
    }
    Ok(())
}

//! Result tree assembly: assigns batch responses to the nodes that asked
//! for them and renders the finished tree into the response envelope.

use serde_json::{Map, Value, json};

use crate::batcher::{GroupMember, ResolutionGroup};
use crate::error::ErrorMarker;
use crate::query_model::{FieldNode, FieldSelection, OperationRequest};
use crate::service_registry::Cardinality;
use crate::{BatchResponse, EntityRecord};

pub type NodeId = usize;

/// Outcome of merging one batch response into the tree.
#[derive(Debug, Default)]
pub struct Merged<'q> {
    /// Relation nodes exposed by the merged entities, resolved next depth.
    pub pending: Vec<GroupMember<'q>>,
    /// Nodes left unresolved because the service answered with entities of
    /// another type.
    pub mistyped: Vec<(NodeId, String)>,
}

fn mistyped(records: &[EntityRecord], expected: &str) -> Option<String> {
    records
        .iter()
        .find(|record| record.entity.entity_type != expected)
        .map(|record| {
            format!(
                "entity {} has type {}, expected {}",
                record.entity.id, record.entity.entity_type, expected
            )
        })
}

/// Key under which a failed node renders its marker.
pub const ERROR_KEY: &str = "$error";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Planned,
    InFlight,
    Resolved,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeValue {
    Unset,
    Scalar(Value),
    Object(Vec<(String, NodeId)>),
    List(Vec<NodeId>),
    Single(Option<NodeId>),
    Error(ErrorMarker),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultNode {
    pub state: NodeState,
    pub value: NodeValue,
}

#[derive(Clone, Debug)]
struct RootEntry {
    service: String,
    operation: String,
    node: NodeId,
}

/// Arena of result nodes for one execution.
#[derive(Clone, Debug, Default)]
pub struct ResultTree {
    nodes: Vec<ResultNode>,
    roots: Vec<RootEntry>,
}

impl ResultTree {
    pub fn new() -> Self {
        ResultTree::default()
    }

    fn push(&mut self, state: NodeState, value: NodeValue) -> NodeId {
        self.nodes.push(ResultNode { state, value });
        self.nodes.len() - 1
    }

    /// Adds a pending node for one `service → operation` entry.
    pub fn add_root(&mut self, service: &str, operation: &str) -> NodeId {
        let node = self.push(NodeState::Pending, NodeValue::Unset);
        self.roots.push(RootEntry {
            service: service.to_string(),
            operation: operation.to_string(),
            node,
        });
        node
    }

    pub fn node(&self, id: NodeId) -> Option<&ResultNode> {
        self.nodes.get(id)
    }

    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|node| node.state)
    }

    pub fn set_state(&mut self, ids: &[NodeId], state: NodeState) {
        for &id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.state = state;
            }
        }
    }

    /// Marks nodes as failed; a node already failed keeps its first marker.
    pub fn fail(&mut self, ids: &[NodeId], marker: &ErrorMarker) {
        for &id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                if node.state != NodeState::Failed {
                    node.state = NodeState::Failed;
                    node.value = NodeValue::Error(marker.clone());
                }
            }
        }
    }

    /// Count of nodes in a given state.
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|node| node.state == state).count()
    }

    /// Assigns a root operation response and returns the relations it exposes.
    ///
    /// Entities of a type other than `entity_type` leave the node unresolved
    /// and are reported in [`Merged::mistyped`].
    pub fn merge_operation<'q>(
        &mut self,
        node: NodeId,
        request: &'q OperationRequest,
        output: &str,
        entity_type: &str,
        response: &BatchResponse,
    ) -> Merged<'q> {
        let mut merged = Merged::default();
        if let Some(message) = mistyped(&response.entities, entity_type) {
            merged.mistyped.push((node, message));
            return merged;
        }

        let mut fields = Vec::with_capacity(request.selection.len());
        for field in &request.selection {
            let child = if field.name == output {
                let entities = response
                    .entities
                    .iter()
                    .map(|record| {
                        self.add_entity(record, field.children(), &mut merged.pending)
                    })
                    .collect();
                self.push(NodeState::Resolved, NodeValue::List(entities))
            } else {
                let value = response
                    .outputs
                    .get(&field.name)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.push(NodeState::Resolved, NodeValue::Scalar(value))
            };
            fields.push((field.name.clone(), child));
        }

        self.resolve(node, NodeValue::Object(fields));
        merged
    }

    /// Splits a relation batch response back onto the group's nodes.
    ///
    /// Lists are truncated to the group's limit in the order the service
    /// returned them; a one-cardinality relation keeps the first record.
    /// Members whose kept records are not of the group's target type stay
    /// unresolved and are reported in [`Merged::mistyped`].
    pub fn merge_group<'q>(
        &mut self,
        group: &ResolutionGroup<'q>,
        response: &BatchResponse,
    ) -> Merged<'q> {
        let related = response.related_by_parent();
        let mut merged = Merged::default();

        for member in &group.members {
            let records = related.get(&member.parent).copied().unwrap_or(&[]);
            let kept = match group.cardinality {
                Cardinality::Many => truncate(records, group.limit),
                Cardinality::One => truncate(records, Some(1)),
            };
            if let Some(message) = mistyped(kept, &group.target_type) {
                merged.mistyped.push((member.node, message));
                continue;
            }

            let mut children: Vec<NodeId> = kept
                .iter()
                .map(|record| {
                    self.add_entity(record, member.selection.children(), &mut merged.pending)
                })
                .collect();
            let value = match group.cardinality {
                Cardinality::Many => NodeValue::List(children),
                Cardinality::One => NodeValue::Single(children.pop()),
            };
            self.resolve(member.node, value);
        }

        merged
    }

    fn resolve(&mut self, id: NodeId, value: NodeValue) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = NodeState::Resolved;
            node.value = value;
        }
    }

    /// Adds an entity object projected onto `selection`, in selection order.
    /// Relation fields become pending nodes rooted at the record's ref.
    fn add_entity<'q>(
        &mut self,
        record: &EntityRecord,
        selection: &'q [FieldSelection],
        pending: &mut Vec<GroupMember<'q>>,
    ) -> NodeId {
        let mut fields = Vec::with_capacity(selection.len());
        for field in selection {
            let child = match field.node {
                FieldNode::Scalar => {
                    let value = record.fields.get(&field.name).cloned().unwrap_or(Value::Null);
                    self.push(NodeState::Resolved, NodeValue::Scalar(value))
                }
                FieldNode::Relation { .. } => {
                    let node = self.push(NodeState::Pending, NodeValue::Unset);
                    pending.push(GroupMember {
                        node,
                        parent: record.entity.clone(),
                        selection: field,
                    });
                    node
                }
            };
            fields.push((field.name.clone(), child));
        }
        self.push(NodeState::Resolved, NodeValue::Object(fields))
    }

    /// Renders the response envelope `{ service: { operation: .. } }`.
    pub fn render(&self) -> Value {
        let mut envelope = Map::new();
        for root in &self.roots {
            let service = envelope
                .entry(root.service.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(operations) = service {
                operations.insert(root.operation.clone(), self.render_node(root.node));
            }
        }
        Value::Object(envelope)
    }

    fn render_node(&self, id: NodeId) -> Value {
        let Some(node) = self.nodes.get(id) else {
            return Value::Null;
        };
        match &node.value {
            NodeValue::Unset => Value::Null,
            NodeValue::Scalar(value) => value.clone(),
            NodeValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, child)| (name.clone(), self.render_node(*child)))
                    .collect(),
            ),
            NodeValue::List(items) => {
                Value::Array(items.iter().map(|child| self.render_node(*child)).collect())
            }
            NodeValue::Single(item) => item.map_or(Value::Null, |child| self.render_node(child)),
            NodeValue::Error(marker) => json!({ ERROR_KEY: marker }),
        }
    }
}

/// Keeps at most `limit` records without reordering them.
pub fn truncate(records: &[EntityRecord], limit: Option<usize>) -> &[EntityRecord] {
    match limit {
        Some(limit) if records.len() > limit => &records[..limit],
        _ => records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::GroupKey;
    use crate::error::ErrorKind;
    use crate::query_model::{Arguments, parse};
    use crate::{EntityRef, RelatedEntities};
    use pretty_assertions::assert_eq;

    fn person(id: &str, name: &str) -> EntityRecord {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!(name));
        fields.insert("mass".to_string(), json!(77));
        EntityRecord {
            entity: EntityRef::new("people", "Person", id),
            fields,
        }
    }

    fn film(id: &str, title: &str) -> EntityRecord {
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!(title));
        EntityRecord {
            entity: EntityRef::new("films", "Film", id),
            fields,
        }
    }

    #[test]
    fn merges_in_selection_order_and_truncates_without_resorting() {
        let query = parse(&json!({
            "films": { "getFilms": { "films": {
                "characters": { "$": { "limit": 2 }, "name": {} },
                "title": {}
            } } }
        }))
        .unwrap();
        let op = &query.operations[0];

        let mut tree = ResultTree::new();
        let root = tree.add_root("films", "getFilms");
        let merged = tree.merge_operation(
            root,
            op,
            "films",
            "Film",
            &BatchResponse {
                entities: vec![film("1", "A New Hope")],
                ..Default::default()
            },
        );
        assert_eq!(merged.pending.len(), 1);
        assert!(merged.mistyped.is_empty());

        let group = ResolutionGroup {
            key: GroupKey {
                service: "people".to_string(),
                operation: "Film.characters".to_string(),
                signature: String::new(),
            },
            arguments: Arguments::new(),
            limit: Some(2),
            cardinality: Cardinality::Many,
            target_type: "Person".to_string(),
            members: merged.pending,
        };
        let children = tree.merge_group(
            &group,
            &BatchResponse {
                related: vec![RelatedEntities {
                    parent: EntityRef::new("films", "Film", "1"),
                    records: vec![
                        person("4", "Darth Vader"),
                        person("1", "Luke Skywalker"),
                        person("2", "C-3PO"),
                    ],
                }],
                ..Default::default()
            },
        );
        assert!(children.pending.is_empty());
        assert!(children.mistyped.is_empty());

        let rendered = tree.render();
        assert_eq!(
            rendered,
            json!({ "films": { "getFilms": { "films": [{
                "characters": [{ "name": "Darth Vader" }, { "name": "Luke Skywalker" }],
                "title": "A New Hope"
            }] } } })
        );
        let keys: Vec<&str> = rendered["films"]["getFilms"]["films"][0]
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["characters", "title"]);
    }

    #[test]
    fn entities_of_another_type_leave_the_node_unresolved() {
        let query = parse(&json!({
            "films": { "getFilms": { "films": {
                "title": {},
                "characters": { "name": {} }
            } } }
        }))
        .unwrap();
        let op = &query.operations[0];

        let mut tree = ResultTree::new();
        let root = tree.add_root("films", "getFilms");
        let merged = tree.merge_operation(
            root,
            op,
            "films",
            "Planet",
            &BatchResponse {
                entities: vec![film("1", "A New Hope")],
                ..Default::default()
            },
        );
        assert!(merged.pending.is_empty());
        assert_eq!(
            merged.mistyped,
            vec![(root, "entity 1 has type Film, expected Planet".to_string())]
        );
        assert_eq!(tree.state(root), Some(NodeState::Pending));

        let root = tree.add_root("films", "getFilms");
        let merged = tree.merge_operation(
            root,
            op,
            "films",
            "Film",
            &BatchResponse {
                entities: vec![film("1", "A New Hope"), film("2", "The Empire Strikes Back")],
                ..Default::default()
            },
        );
        let (first, second) = (merged.pending[0].node, merged.pending[1].node);
        let group = ResolutionGroup {
            key: GroupKey {
                service: "people".to_string(),
                operation: "Film.characters".to_string(),
                signature: String::new(),
            },
            arguments: Arguments::new(),
            limit: None,
            cardinality: Cardinality::Many,
            target_type: "Person".to_string(),
            members: merged.pending,
        };
        let merged = tree.merge_group(
            &group,
            &BatchResponse {
                related: vec![
                    RelatedEntities {
                        parent: EntityRef::new("films", "Film", "1"),
                        records: vec![person("1", "Luke Skywalker")],
                    },
                    RelatedEntities {
                        parent: EntityRef::new("films", "Film", "2"),
                        records: vec![person("4", "Darth Vader"), film("1", "A New Hope")],
                    },
                ],
                ..Default::default()
            },
        );
        assert_eq!(tree.state(first), Some(NodeState::Resolved));
        assert_eq!(merged.mistyped.len(), 1);
        assert_eq!(merged.mistyped[0].0, second);
        assert_ne!(tree.state(second), Some(NodeState::Resolved));
    }

    #[test]
    fn failed_nodes_render_markers() {
        let mut tree = ResultTree::new();
        let root = tree.add_root("films", "getFilms");
        let marker = ErrorMarker {
            kind: ErrorKind::TransportError,
            message: "boom".to_string(),
        };
        tree.fail(&[root], &marker);
        assert_eq!(tree.state(root), Some(NodeState::Failed));
        assert_eq!(
            tree.render(),
            json!({ "films": { "getFilms": { "$error": { "kind": "TransportError", "message": "boom" } } } })
        );
    }

    #[test]
    fn truncate_keeps_prefix() {
        let records = vec![person("3", "R2-D2"), person("1", "Luke Skywalker")];
        assert_eq!(truncate(&records, Some(1)).len(), 1);
        assert_eq!(truncate(&records, Some(1))[0].entity.id, "3");
        assert_eq!(truncate(&records, None).len(), 2);
        assert_eq!(truncate(&records, Some(5)).len(), 2);
    }
}

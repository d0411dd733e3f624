//! Collapses a resolution group into one deduplicated batch request.

use std::collections::HashSet;

use crate::merger::NodeId;
use crate::query_model::{Arguments, FieldNode, FieldSelection, argument_signature};
use crate::service_registry::Cardinality;
use crate::{BatchRequest, EntityRef};

/// Grouping key: relations sharing all three parts travel in one batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub service: String,
    pub operation: String,
    pub signature: String,
}

/// A relation field instance waiting to be resolved for one parent entity.
#[derive(Clone, Debug)]
pub struct GroupMember<'q> {
    pub node: NodeId,
    pub parent: EntityRef,
    pub selection: &'q FieldSelection,
}

/// Relation nodes of one depth sharing target service, relation and arguments.
#[derive(Clone, Debug)]
pub struct ResolutionGroup<'q> {
    pub key: GroupKey,
    /// Arguments sent to the service, with the effective limit filled in.
    pub arguments: Arguments,
    pub limit: Option<usize>,
    pub cardinality: Cardinality,
    pub target_type: String,
    pub members: Vec<GroupMember<'q>>,
}

impl ResolutionGroup<'_> {
    pub fn nodes(&self) -> Vec<NodeId> {
        self.members.iter().map(|member| member.node).collect()
    }
}

/// Builds the batch request for a group: unique parents in first-seen order
/// and the union of the members' sub-selections.
pub fn batch(group: &ResolutionGroup<'_>) -> BatchRequest {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut selection = Vec::new();

    for member in &group.members {
        if seen.insert(&member.parent) {
            ids.push(member.parent.clone());
        }
        union_into(&mut selection, member.selection.children());
    }

    BatchRequest {
        service: group.key.service.clone(),
        operation: group.key.operation.clone(),
        arguments: group.arguments.clone(),
        ids,
        selection,
    }
}

/// Merges `source` into `target`, keeping the first-seen field order.
///
/// Relations are merged by name and their children unioned recursively.
/// Nested relations are batched at their own depth under their own
/// arguments, so when two occurrences disagree on arguments the merged
/// relation carries none rather than one occurrence's.
pub fn union_into(target: &mut Vec<FieldSelection>, source: &[FieldSelection]) {
    for field in source {
        let Some(existing) = target.iter_mut().find(|f| f.name == field.name) else {
            target.push(field.clone());
            continue;
        };

        match (&mut existing.node, &field.node) {
            (
                FieldNode::Relation {
                    arguments,
                    children,
                },
                FieldNode::Relation {
                    arguments: incoming_arguments,
                    children: incoming,
                },
            ) => {
                if argument_signature(arguments) != argument_signature(incoming_arguments) {
                    arguments.clear();
                }
                union_into(children, incoming);
            }
            (FieldNode::Scalar, FieldNode::Relation { .. }) => *existing = field.clone(),
            _ => {}
        }
    }
}

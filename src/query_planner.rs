use serde_json::Value;
use std::collections::HashMap;

use crate::batcher::{GroupKey, GroupMember, ResolutionGroup};
use crate::error::{FetchError, FetchResult};
use crate::query_model::{Arguments, argument_signature};
use crate::service_registry::{Cardinality, ServiceRegistry};

/// Resolution plan for one depth level.
#[derive(Debug, Default)]
pub struct DepthPlan<'q> {
    pub depth: usize,
    pub groups: Vec<ResolutionGroup<'q>>,
    /// Relation nodes past the depth bound; never dispatched.
    pub over_depth: Vec<GroupMember<'q>>,
}

pub trait QueryPlanner: Send + Sync {
    fn plan_depth<'q>(
        &self,
        depth: usize,
        frontier: Vec<GroupMember<'q>>,
        registry: &ServiceRegistry,
    ) -> FetchResult<DepthPlan<'q>>;
}

/// Groups every pending relation of a depth by
/// (target service, relation, argument signature).
pub struct DepthPlanner {
    max_depth: usize,
}

impl DepthPlanner {
    pub fn new(max_depth: usize) -> Self {
        DepthPlanner { max_depth }
    }
}

impl QueryPlanner for DepthPlanner {
    fn plan_depth<'q>(
        &self,
        depth: usize,
        frontier: Vec<GroupMember<'q>>,
        registry: &ServiceRegistry,
    ) -> FetchResult<DepthPlan<'q>> {
        if depth > self.max_depth {
            return Ok(DepthPlan {
                depth,
                groups: Vec::new(),
                over_depth: frontier,
            });
        }

        let mut groups: Vec<ResolutionGroup<'q>> = Vec::new();
        let mut index: HashMap<GroupKey, usize> = HashMap::new();

        for member in frontier {
            let parent_type = &member.parent.entity_type;
            let relation = registry
                .relation(parent_type, &member.selection.name)
                .ok_or_else(|| FetchError::UnknownField {
                    entity_type: parent_type.clone(),
                    field: member.selection.name.clone(),
                })?;
            let descriptor = &relation.descriptor;

            let mut arguments: Arguments = member.selection.arguments().cloned().unwrap_or_default();
            let limit = match descriptor.cardinality {
                Cardinality::Many => {
                    let limit = member.selection.limit().or(descriptor.default_limit);
                    if let Some(limit) = limit {
                        arguments.insert("limit".to_string(), Value::from(limit));
                    }
                    limit
                }
                Cardinality::One => None,
            };

            let key = GroupKey {
                service: relation.service.clone(),
                operation: relation.operation.clone(),
                signature: argument_signature(&arguments),
            };
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push(ResolutionGroup {
                    key,
                    arguments,
                    limit,
                    cardinality: descriptor.cardinality,
                    target_type: descriptor.target_type.clone(),
                    members: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].members.push(member);
        }

        Ok(DepthPlan {
            depth,
            groups,
            over_depth: Vec::new(),
        })
    }
}

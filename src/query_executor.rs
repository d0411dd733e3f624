//! Breadth-first relation resolution.
//!
//! Root operations run first (depth 0). Every relation they expose is planned
//! into resolution groups for depth 1, one batch per group, and so on until no
//! relation is pending, the depth bound is hit, the deadline passes or the
//! caller cancels.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::{self, GroupKey, GroupMember, union_into};
use crate::config::{FailurePolicy, ResolverConfig};
use crate::error::{FetchError, FetchResult, TransportError};
use crate::merger::{NodeId, NodeState, ResultTree};
use crate::query_model::{QueryRequest, selection_signature};
use crate::query_planner::{DepthPlan, QueryPlanner};
use crate::service_registry::ServiceRegistry;
use crate::transport::Transport;
use crate::{BatchRequest, BatchResponse, EntityRecord, EntityRef, RelatedEntities};

type SendResult = Result<BatchResponse, TransportError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct MemoKey {
    group: GroupKey,
    selection: String,
}

/// Related records already fetched during one execution, per parent ref.
#[derive(Debug, Default)]
struct FetchMemo {
    entries: HashMap<MemoKey, HashMap<EntityRef, Vec<EntityRecord>>>,
}

impl FetchMemo {
    fn contains(&self, key: &MemoKey, id: &EntityRef) -> bool {
        self.entries
            .get(key)
            .is_some_and(|fetched| fetched.contains_key(id))
    }

    /// Records every id of `ids` not fetched yet; ids the service left out
    /// of its answer resolve to no records.
    fn store(&mut self, key: &MemoKey, ids: &[EntityRef], response: &BatchResponse) {
        let related = response.related_by_parent();
        let fetched = self.entries.entry(key.clone()).or_default();
        for id in ids {
            if !fetched.contains_key(id) {
                let records = related.get(id).map(|r| r.to_vec()).unwrap_or_default();
                fetched.insert(id.clone(), records);
            }
        }
    }

    fn response(&self, key: &MemoKey, ids: &[EntityRef]) -> BatchResponse {
        let fetched = self.entries.get(key);
        let related = ids
            .iter()
            .map(|id| RelatedEntities {
                parent: id.clone(),
                records: fetched
                    .and_then(|f| f.get(id))
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();
        BatchResponse {
            related,
            ..BatchResponse::default()
        }
    }
}

/// Results of one depth's dispatch, indexed like the requests sent.
/// `None` marks a batch that never completed.
struct Dispatched {
    results: Vec<Option<SendResult>>,
    timed_out: bool,
}

pub struct RelationResolver<'a> {
    registry: &'a ServiceRegistry,
    transport: &'a dyn Transport,
    planner: &'a dyn QueryPlanner,
    config: &'a ResolverConfig,
}

impl<'a> RelationResolver<'a> {
    pub fn new(
        registry: &'a ServiceRegistry,
        transport: &'a dyn Transport,
        planner: &'a dyn QueryPlanner,
        config: &'a ResolverConfig,
    ) -> Self {
        RelationResolver {
            registry,
            transport,
            planner,
            config,
        }
    }

    /// Resolves a validated query into its response envelope.
    pub async fn resolve(
        &self,
        query: &QueryRequest,
        cancel: &CancellationToken,
    ) -> FetchResult<serde_json::Value> {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.config.timeout)
            .unwrap_or_else(|| started + Duration::from_secs(86_400));

        let mut tree = ResultTree::new();
        let mut memo = FetchMemo::default();
        let mut frontier = self
            .resolve_roots(query, &mut tree, deadline, cancel)
            .await?;
        let mut depth = 1;

        while !frontier.is_empty() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if Instant::now() >= deadline {
                let nodes: Vec<NodeId> = frontier.iter().map(|m| m.node).collect();
                self.expire(&mut tree, &nodes)?;
                break;
            }

            let plan = self
                .planner
                .plan_depth(depth, std::mem::take(&mut frontier), self.registry)?;
            self.reject_over_depth(&mut tree, &plan)?;
            frontier = self
                .resolve_depth(plan, &mut tree, &mut memo, deadline, cancel)
                .await?;
            depth += 1;
        }

        info!(
            depths = depth,
            resolved = tree.count(NodeState::Resolved),
            failed = tree.count(NodeState::Failed),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query resolved"
        );
        Ok(tree.render())
    }

    async fn resolve_roots<'q>(
        &self,
        query: &'q QueryRequest,
        tree: &mut ResultTree,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FetchResult<Vec<GroupMember<'q>>> {
        let mut roots = Vec::with_capacity(query.operations.len());
        let mut requests = Vec::with_capacity(query.operations.len());

        for operation in &query.operations {
            let binding = self
                .registry
                .operation(&operation.service, &operation.operation)
                .ok_or_else(|| FetchError::UnknownOperation {
                    service: operation.service.clone(),
                    operation: operation.operation.clone(),
                })?;
            let output = binding.descriptor.output.as_str();
            let entity_type = binding.descriptor.entity_type.as_str();

            let mut selection = Vec::new();
            for field in operation.selection.iter().filter(|f| f.name == output) {
                union_into(&mut selection, field.children());
            }

            let node = tree.add_root(&operation.service, &operation.operation);
            tree.set_state(&[node], NodeState::InFlight);
            roots.push((node, operation, output, entity_type));
            requests.push(BatchRequest {
                service: operation.service.clone(),
                operation: operation.operation.clone(),
                arguments: operation.arguments.clone(),
                ids: Vec::new(),
                selection,
            });
        }

        let dispatched = self.dispatch(requests, deadline, cancel).await?;
        let mut frontier = Vec::new();
        let mut unfinished = Vec::new();

        for ((node, operation, output, entity_type), result) in
            roots.into_iter().zip(dispatched.results)
        {
            match result {
                Some(Ok(response)) => {
                    let merged =
                        tree.merge_operation(node, operation, output, entity_type, &response);
                    self.reject_mistyped(
                        tree,
                        &operation.service,
                        &operation.operation,
                        merged.mistyped,
                    )?;
                    frontier.extend(merged.pending);
                }
                Some(Err(e)) => self.on_failure(tree, &[node], e.into())?,
                None => unfinished.push(node),
            }
        }

        if dispatched.timed_out {
            unfinished.extend(frontier.iter().map(|m| m.node));
            self.expire(tree, &unfinished)?;
            return Ok(Vec::new());
        }
        Ok(frontier)
    }

    async fn resolve_depth<'q>(
        &self,
        plan: DepthPlan<'q>,
        tree: &mut ResultTree,
        memo: &mut FetchMemo,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FetchResult<Vec<GroupMember<'q>>> {
        let mut prepared = Vec::with_capacity(plan.groups.len());
        let mut requests = Vec::new();
        let mut owners = Vec::new();

        for (index, group) in plan.groups.iter().enumerate() {
            let nodes = group.nodes();
            tree.set_state(&nodes, NodeState::Planned);

            let request = batcher::batch(group);
            let key = MemoKey {
                group: group.key.clone(),
                selection: selection_signature(&request.selection),
            };
            let ids = request.ids.clone();
            let missing: Vec<EntityRef> = ids
                .iter()
                .filter(|id| !memo.contains(&key, id))
                .cloned()
                .collect();

            debug!(
                depth = plan.depth,
                service = %group.key.service,
                operation = %group.key.operation,
                members = group.members.len(),
                ids = ids.len(),
                memoized = ids.len() - missing.len(),
                "planned resolution group"
            );

            if !missing.is_empty() {
                tree.set_state(&nodes, NodeState::InFlight);
                owners.push(index);
                requests.push(BatchRequest {
                    ids: missing,
                    ..request
                });
            }
            prepared.push((key, ids));
        }

        let dispatched = self.dispatch(requests, deadline, cancel).await?;
        let mut fetched: HashMap<usize, Option<SendResult>> =
            owners.into_iter().zip(dispatched.results).collect();
        let mut next = Vec::new();
        let mut unfinished = Vec::new();

        for (index, (group, (key, ids))) in plan.groups.iter().zip(&prepared).enumerate() {
            match fetched.remove(&index) {
                None => {}
                Some(Some(Ok(response))) => memo.store(key, ids, &response),
                Some(Some(Err(e))) => {
                    self.on_failure(tree, &group.nodes(), e.into())?;
                    continue;
                }
                Some(None) => {
                    unfinished.extend(group.nodes());
                    continue;
                }
            }
            let response = memo.response(key, ids);
            let merged = tree.merge_group(group, &response);
            self.reject_mistyped(
                tree,
                &group.key.service,
                &group.key.operation,
                merged.mistyped,
            )?;
            next.extend(merged.pending);
        }

        if dispatched.timed_out {
            unfinished.extend(next.iter().map(|m| m.node));
            self.expire(tree, &unfinished)?;
            return Ok(Vec::new());
        }
        Ok(next)
    }

    /// Sends one depth's batches, at most `max_parallelism` at a time.
    ///
    /// Under the abort policy the first failed batch stops collection.
    async fn dispatch(
        &self,
        requests: Vec<BatchRequest>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> FetchResult<Dispatched> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let abort = self.config.failure_policy == FailurePolicy::Abort;
        let mut results: Vec<Option<SendResult>> = Vec::new();
        results.resize_with(requests.len(), || None);

        let transport = self.transport;
        let mut in_flight = stream::iter(requests.into_iter().enumerate())
            .map(move |(index, request)| async move {
                debug!(
                    service = %request.service,
                    operation = %request.operation,
                    ids = request.ids.len(),
                    "dispatching batch"
                );
                (index, transport.send(request).await)
            })
            .buffer_unordered(self.config.max_parallelism.max(1));

        let collect = async {
            while let Some((index, result)) = in_flight.next().await {
                let failed = result.is_err();
                results[index] = Some(result);
                if failed && abort {
                    break;
                }
            }
        };

        let timed_out = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            finished = timeout_at(deadline, collect) => finished.is_err(),
        };

        Ok(Dispatched { results, timed_out })
    }

    fn reject_over_depth(&self, tree: &mut ResultTree, plan: &DepthPlan<'_>) -> FetchResult<()> {
        for member in &plan.over_depth {
            let error = FetchError::CycleDepthExceeded {
                relation: format!("{}.{}", member.parent.entity_type, member.selection.name),
                depth: plan.depth,
                max_depth: self.config.max_depth,
            };
            self.on_failure(tree, &[member.node], error)?;
        }
        Ok(())
    }

    /// A service answering with entities of the wrong type fails like a
    /// transport error on the nodes it was meant to fill.
    fn reject_mistyped(
        &self,
        tree: &mut ResultTree,
        service: &str,
        operation: &str,
        mistyped: Vec<(NodeId, String)>,
    ) -> FetchResult<()> {
        for (node, message) in mistyped {
            let error = TransportError::new(service, operation, message);
            self.on_failure(tree, &[node], error.into())?;
        }
        Ok(())
    }

    fn expire(&self, tree: &mut ResultTree, nodes: &[NodeId]) -> FetchResult<()> {
        let error = FetchError::Timeout {
            duration_ms: self.config.timeout.as_millis() as u64,
        };
        self.on_failure(tree, nodes, error)
    }

    /// Abort propagates `error`; isolate records it on `nodes` and carries on.
    fn on_failure(
        &self,
        tree: &mut ResultTree,
        nodes: &[NodeId],
        error: FetchError,
    ) -> FetchResult<()> {
        match self.config.failure_policy {
            FailurePolicy::Abort => Err(error),
            FailurePolicy::Isolate => {
                warn!(nodes = nodes.len(), error = %error, "isolating failed subtree");
                tree.fail(nodes, &error.to_marker());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_model::parse;
    use crate::query_planner::DepthPlanner;
    use crate::swapi::{self, FILM_SERVICE, PERSON_SERVICE};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording<T> {
        inner: T,
        sent: Mutex<Vec<BatchRequest>>,
    }

    #[async_trait]
    impl<T: Transport> Transport for Recording<T> {
        async fn send(&self, request: BatchRequest) -> Result<BatchResponse, TransportError> {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(request.clone());
            }
            self.inner.send(request).await
        }
    }

    /// Tracks the highest number of batches in flight at once.
    struct Gauge<T> {
        inner: T,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl<T: Transport> Transport for Gauge<T> {
        async fn send(&self, request: BatchRequest) -> Result<BatchResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.send(request).await
        }
    }

    async fn resolve_with(
        transport: &dyn Transport,
        literal: serde_json::Value,
        config: &ResolverConfig,
    ) -> FetchResult<serde_json::Value> {
        let registry = swapi::registry().unwrap();
        let planner = DepthPlanner::new(config.max_depth);
        let query = parse(&literal).unwrap();
        registry.validate(&query).unwrap();
        RelationResolver::new(&registry, transport, &planner, config)
            .resolve(&query, &CancellationToken::new())
            .await
    }

    async fn run(
        literal: serde_json::Value,
        config: ResolverConfig,
    ) -> (FetchResult<serde_json::Value>, Vec<BatchRequest>) {
        let transport = Recording {
            inner: swapi::transport().unwrap(),
            sent: Mutex::new(Vec::new()),
        };
        let result = resolve_with(&transport, literal, &config).await;
        (result, transport.sent.into_inner().unwrap())
    }

    async fn peak_parallelism(config: ResolverConfig) -> usize {
        let transport = Gauge {
            inner: swapi::transport().unwrap(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        // Four groups at depth 1, one per relation.
        let literal = json!({ FILM_SERVICE: { "getFilms": {
            "$": { "ids": ["1"] },
            "films": {
                "characters": { "name": {} },
                "planets": { "name": {} },
                "species": { "name": {} },
                "starships": { "name": {} }
            }
        }}});
        let data = resolve_with(&transport, literal, &config).await.unwrap();
        assert_eq!(
            data[FILM_SERVICE]["getFilms"]["films"][0]["planets"][0],
            json!({ "name": "Tatooine" })
        );
        transport.peak.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn groups_of_one_depth_overlap() {
        assert_eq!(peak_parallelism(ResolverConfig::default()).await, 4);
    }

    #[tokio::test]
    async fn max_parallelism_bounds_in_flight_batches() {
        assert_eq!(peak_parallelism(ResolverConfig::default().with_max_parallelism(1)).await, 1);
        assert_eq!(peak_parallelism(ResolverConfig::default().with_max_parallelism(2)).await, 2);
    }

    #[tokio::test]
    async fn memoized_parents_are_not_fetched_again() {
        // Luke's homeworld is fetched at depth 1 and reached again through
        // his species at depth 3 with the same selection.
        let (result, sent) = run(
            json!({ PERSON_SERVICE: { "getPeople": {
                "$": { "ids": ["1"] },
                "people": {
                    "homeworld": { "name": {} },
                    "species": { "people": { "homeworld": { "name": {} } } }
                }
            }}}),
            ResolverConfig::default(),
        )
        .await;
        let data = result.unwrap();

        let homeworld_calls: Vec<&BatchRequest> = sent
            .iter()
            .filter(|r| r.operation == "Person.homeworld")
            .collect();
        assert_eq!(homeworld_calls.len(), 2);
        let refetched: Vec<&str> = homeworld_calls[1].ids.iter().map(|id| id.id.as_str()).collect();
        assert_eq!(refetched, vec!["4", "5", "10", "14"]);

        let luke = &data[PERSON_SERVICE]["getPeople"]["people"][0];
        assert_eq!(luke["homeworld"], json!({ "name": "Tatooine" }));
        assert_eq!(
            luke["species"][0]["people"][0]["homeworld"],
            json!({ "name": "Tatooine" })
        );
    }

    #[tokio::test]
    async fn scalar_only_query_makes_one_call() {
        let (result, sent) = run(
            json!({ FILM_SERVICE: { "getFilms": {
                "$": { "ids": ["1"] },
                "films": { "title": {} }
            }}}),
            ResolverConfig::default(),
        )
        .await;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            result.unwrap(),
            json!({ FILM_SERVICE: { "getFilms": { "films": [{ "title": "A New Hope" }] } } })
        );
    }

    #[tokio::test]
    async fn depth_bound_marks_nodes_under_isolate() {
        let (result, sent) = run(
            json!({ PERSON_SERVICE: { "getPeople": {
                "$": { "ids": ["1"] },
                "people": { "homeworld": { "residents": { "name": {} } } }
            }}}),
            ResolverConfig::default()
                .with_max_depth(1)
                .with_failure_policy(FailurePolicy::Isolate),
        )
        .await;
        let data = result.unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            data[PERSON_SERVICE]["getPeople"]["people"][0]["homeworld"]["residents"]["$error"]
                ["kind"],
            json!("CycleDepthExceeded")
        );
    }
}

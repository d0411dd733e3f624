use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{GatewayConfig, ResolverConfig};
use crate::error::FetchResult;
use crate::query_executor::RelationResolver;
use crate::query_model::{self, QueryRequest};
use crate::query_planner::{DepthPlanner, QueryPlanner};
use crate::service_registry::ServiceRegistry;
use crate::transport::{HttpTransport, Transport};

/// Entry point of the engine: validates query literals against the
/// composed registry and resolves them through a transport.
pub struct Gateway {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    planner: Box<dyn QueryPlanner>,
    config: ResolverConfig,
}

impl Gateway {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn Transport>,
        config: ResolverConfig,
    ) -> Self {
        Gateway {
            registry,
            transport,
            planner: Box::new(DepthPlanner::new(config.max_depth)),
            config,
        }
    }

    /// Composes the configured services and routes them over HTTP.
    pub fn from_config(config: &GatewayConfig) -> FetchResult<Self> {
        let registry = ServiceRegistry::compose(config.descriptors())?;
        let transport = HttpTransport::new(config.routes());
        info!(
            services = registry.services().len(),
            "composed service registry"
        );
        Ok(Gateway::new(
            Arc::new(registry),
            Arc::new(transport),
            config.resolver_config(),
        ))
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Parses and validates a query literal without resolving it.
    pub fn prepare(&self, literal: &Value) -> FetchResult<PreparedQuery> {
        self.validate(query_model::parse(literal)?)
    }

    /// Checks an already parsed query against the registry.
    pub fn validate(&self, query: QueryRequest) -> FetchResult<PreparedQuery> {
        self.registry.validate(&query)?;
        Ok(PreparedQuery { query })
    }

    #[instrument(skip_all)]
    pub async fn process_request(&self, literal: &Value) -> FetchResult<Value> {
        let query = self.prepare(literal)?;
        self.execute(&query).await
    }

    pub async fn execute(&self, query: &PreparedQuery) -> FetchResult<Value> {
        self.execute_with_cancellation(query, CancellationToken::new())
            .await
    }

    /// Resolves `query`; cancelling `cancel` stops it between and during
    /// depths with [`FetchError::Cancelled`](crate::FetchError::Cancelled).
    #[instrument(skip_all, fields(operations = query.query.operations.len()))]
    pub async fn execute_with_cancellation(
        &self,
        query: &PreparedQuery,
        cancel: CancellationToken,
    ) -> FetchResult<Value> {
        let query = &query.query;
        debug!(relation_depth = query.relation_depth(), "executing query");

        RelationResolver::new(
            &self.registry,
            self.transport.as_ref(),
            self.planner.as_ref(),
            &self.config,
        )
        .resolve(query, &cancel)
        .await
    }
}

/// A query that passed validation against a gateway's registry.
#[derive(Clone, Debug)]
pub struct PreparedQuery {
    query: QueryRequest,
}

impl PreparedQuery {
    pub fn query(&self) -> &QueryRequest {
        &self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::swapi::{self, FILM_SERVICE};
    use serde_json::json;

    fn gateway() -> Gateway {
        Gateway::new(
            Arc::new(swapi::registry().unwrap()),
            Arc::new(swapi::transport().unwrap()),
            ResolverConfig::default(),
        )
    }

    #[tokio::test]
    async fn unknown_fields_fail_before_any_call() {
        let err = gateway()
            .process_request(&json!({ FILM_SERVICE: { "getFilms": {
                "films": { "rating": {} }
            }}}))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnknownField { .. }));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_execution() {
        let gateway = gateway();
        let query = gateway
            .prepare(&json!({ FILM_SERVICE: { "getFilms": { "films": { "title": {} } } } }))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            gateway.execute_with_cancellation(&query, cancel).await,
            Err(FetchError::Cancelled)
        );
    }

    #[tokio::test]
    async fn parsed_queries_are_validated_once_up_front() {
        let gateway = gateway();
        let bad = query_model::parse(&json!({ FILM_SERVICE: { "getFilms": {
            "films": { "title": { "lang": {} } }
        }}}))
        .unwrap();
        assert!(matches!(gateway.validate(bad), Err(FetchError::ParseError { .. })));

        let query = query_model::parse(&json!({ FILM_SERVICE: { "getFilms": {
            "$": { "ids": ["2"] },
            "films": { "title": {} }
        }}}))
        .unwrap();
        let prepared = gateway.validate(query.clone()).unwrap();
        assert_eq!(prepared.query(), &query);
        assert_eq!(
            gateway.execute(&prepared).await.unwrap(),
            json!({ FILM_SERVICE: { "getFilms": { "films": [{ "title": "The Empire Strikes Back" }] } } })
        );
    }
}

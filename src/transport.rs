use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::error::TransportError;
use crate::{BatchRequest, BatchResponse};

pub use crate::catalog::InMemoryTransport;

/// Performs one batch call against a service.
///
/// Root operations are sent with empty `ids`; relation batches carry the
/// deduplicated parent refs.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: BatchRequest) -> Result<BatchResponse, TransportError>;
}

/// Sends batch requests as JSON over HTTP to `{routing_url}/{service}/{operation}`.
pub struct HttpTransport {
    client: reqwest::Client,
    routes: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(routes: HashMap<String, String>) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            routes,
        }
    }

    fn endpoint(&self, request: &BatchRequest) -> Result<String, TransportError> {
        let base = self.routes.get(&request.service).ok_or_else(|| {
            TransportError::new(
                &request.service,
                &request.operation,
                "no routing url configured",
            )
        })?;
        Ok(format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            request.service,
            request.operation
        ))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: BatchRequest) -> Result<BatchResponse, TransportError> {
        let url = self.endpoint(&request)?;
        let service = request.service.clone();
        let operation = request.operation.clone();
        debug!(%url, ids = request.ids.len(), "sending batch request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                TransportError::new(&service, &operation, format!("failed to send request: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                &service,
                &operation,
                format!("service responded with {}: {}", status, body),
            ));
        }

        response.json::<BatchResponse>().await.map_err(|e| {
            TransportError::new(&service, &operation, format!("failed to parse response: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_model::FieldSelection;

    fn request(service: &str) -> BatchRequest {
        BatchRequest {
            service: service.to_string(),
            operation: "getFilms".to_string(),
            arguments: Default::default(),
            ids: vec![],
            selection: vec![FieldSelection::scalar("title")],
        }
    }

    #[test]
    fn endpoint_joins_routing_url_service_and_operation() {
        let transport = HttpTransport::new(HashMap::from([(
            "films".to_string(),
            "http://127.0.0.1:30485/".to_string(),
        )]));
        assert_eq!(
            transport.endpoint(&request("films")).unwrap(),
            "http://127.0.0.1:30485/films/getFilms"
        );
    }

    #[tokio::test]
    async fn unrouted_service_fails_without_a_call() {
        let transport = HttpTransport::new(HashMap::new());
        let err = transport.send(request("films")).await.unwrap_err();
        assert_eq!(err.service, "films");
        assert!(err.message.contains("no routing url"));
    }
}

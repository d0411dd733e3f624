//! Gateway configuration loaded from YAML.
//!
//! ```yaml
//! resolver:
//!   max_depth: 10
//!   timeout_ms: 30000
//!   failure_policy: abort
//!   max_parallelism: 10
//! services:
//!   film.v1.FilmService:
//!     routing_url: http://127.0.0.1:30485
//!     entities: [...]
//!     operations: [...]
//!     relations: [...]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs};

use crate::error::{FetchError, FetchResult};
use crate::service_registry::{
    EntityDescriptor, OperationDescriptor, RelationDescriptor, ServiceDescriptor,
};

pub const ENV_MAX_DEPTH: &str = "WEFT_MAX_DEPTH";
pub const ENV_TIMEOUT_MS: &str = "WEFT_TIMEOUT_MS";
pub const ENV_FAILURE_POLICY: &str = "WEFT_FAILURE_POLICY";

/// What happens to a query when one of its batches fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the whole query with the first error.
    #[default]
    Abort,
    /// Mark the failed subtree and keep resolving its siblings.
    Isolate,
}

impl FromStr for FailurePolicy {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "isolate" => Ok(FailurePolicy::Isolate),
            other => Err(FetchError::config(format!("unknown failure policy '{}'", other))),
        }
    }
}

/// Execution settings of the relation resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    /// Deepest relation level that is still fetched. Root operations are depth 0.
    pub max_depth: usize,
    /// Bound on the cumulative latency of one execution.
    pub timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Batches of one depth in flight at once.
    pub max_parallelism: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::Abort,
            max_parallelism: 10,
        }
    }
}

impl ResolverConfig {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }
}

/// The `resolver` section as written in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    pub max_depth: usize,
    pub timeout_ms: u64,
    pub failure_policy: FailurePolicy,
    pub max_parallelism: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        let defaults = ResolverConfig::default();
        Self {
            max_depth: defaults.max_depth,
            timeout_ms: defaults.timeout.as_millis() as u64,
            failure_policy: defaults.failure_policy,
            max_parallelism: defaults.max_parallelism,
        }
    }
}

impl From<&ResolverSettings> for ResolverConfig {
    fn from(settings: &ResolverSettings) -> Self {
        ResolverConfig::default()
            .with_max_depth(settings.max_depth)
            .with_timeout(Duration::from_millis(settings.timeout_ms))
            .with_failure_policy(settings.failure_policy)
            .with_max_parallelism(settings.max_parallelism)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub routing_url: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
    #[serde(default)]
    pub operations: Vec<OperationDescriptor>,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub resolver: ResolverSettings,
    pub services: BTreeMap<String, ServiceConfig>,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> FetchResult<GatewayConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            FetchError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        GatewayConfig::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> FetchResult<GatewayConfig> {
        serde_yaml::from_str(contents)
            .map_err(|e| FetchError::config(format!("failed to parse config: {}", e)))
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.services
            .iter()
            .map(|(name, service)| ServiceDescriptor {
                name: name.clone(),
                entities: service.entities.clone(),
                operations: service.operations.clone(),
                relations: service.relations.clone(),
            })
            .collect()
    }

    /// Routing url per service, for services that declare one.
    pub fn routes(&self) -> HashMap<String, String> {
        self.services
            .iter()
            .filter_map(|(name, service)| {
                service
                    .routing_url
                    .as_ref()
                    .map(|url| (name.clone(), url.clone()))
            })
            .collect()
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig::from(&self.resolver)
    }

    /// Overrides resolver settings from `WEFT_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> FetchResult<()> {
        if let Ok(value) = env::var(ENV_MAX_DEPTH) {
            self.resolver.max_depth = parse_env(ENV_MAX_DEPTH, &value)?;
        }
        if let Ok(value) = env::var(ENV_TIMEOUT_MS) {
            self.resolver.timeout_ms = parse_env(ENV_TIMEOUT_MS, &value)?;
        }
        if let Ok(value) = env::var(ENV_FAILURE_POLICY) {
            self.resolver.failure_policy = value.parse()?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> FetchResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FetchError::config(format!("{} has an invalid value '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_registry::Cardinality;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
resolver:
  max_depth: 4
  failure_policy: isolate
services:
  film.v1.FilmService:
    routing_url: http://127.0.0.1:30485
    entities:
      - name: Film
        fields: [id, title]
    operations:
      - name: getFilms
        entity_type: Film
        output: films
  person.v1.PersonService:
    entities:
      - name: Person
        fields: [id, name]
    relations:
      - parent_type: Film
        name: characters
        target_type: Person
        cardinality: many
        default_limit: 10
"#;

    #[test]
    fn parses_services_and_fills_resolver_defaults() {
        let config = GatewayConfig::from_yaml_str(CONFIG).unwrap();
        let resolver = config.resolver_config();
        assert_eq!(resolver.max_depth, 4);
        assert_eq!(resolver.failure_policy, FailurePolicy::Isolate);
        assert_eq!(resolver.timeout, Duration::from_secs(30));
        assert_eq!(resolver.max_parallelism, 10);

        let descriptors = config.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].operations[0].accepts_arguments);
        assert_eq!(descriptors[1].relations[0].cardinality, Cardinality::Many);
        assert_eq!(
            config.routes(),
            HashMap::from([(
                "film.v1.FilmService".to_string(),
                "http://127.0.0.1:30485".to_string()
            )])
        );
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            GatewayConfig::from_yaml_str("services: [1, 2"),
            Err(FetchError::Config { .. })
        ));
        assert!(GatewayConfig::load("/nonexistent/weft.yaml").is_err());
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!("Isolate".parse::<FailurePolicy>().unwrap(), FailurePolicy::Isolate);
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}

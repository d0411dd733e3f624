//! Bundled Star Wars services, used by the demo server and the tests.

use serde_json::Value;
use std::sync::Arc;

use crate::catalog::{Catalog, InMemoryTransport};
use crate::config::GatewayConfig;
use crate::error::{FetchError, FetchResult};
use crate::service_registry::ServiceRegistry;

const SWAPI_CONFIG: &str = include_str!(concat!(env!("OUT_SCHEMAS"), "/swapi.yaml"));
const SWAPI_DATA: &str = include_str!(concat!(env!("OUT_SCHEMAS"), "/swapi_data.json"));

pub const FILM_SERVICE: &str = "film.v1.FilmService";
pub const PERSON_SERVICE: &str = "person.v1.PersonService";
pub const PLANET_SERVICE: &str = "planet.v1.PlanetService";
pub const SPECIES_SERVICE: &str = "species.v1.SpeciesService";
pub const STARSHIP_SERVICE: &str = "starship.v1.StarshipService";
pub const VEHICLE_SERVICE: &str = "vehicle.v1.VehicleService";

pub fn config() -> FetchResult<GatewayConfig> {
    GatewayConfig::from_yaml_str(SWAPI_CONFIG)
}

pub fn registry() -> FetchResult<ServiceRegistry> {
    ServiceRegistry::compose(config()?.descriptors())
}

pub fn catalog(registry: Arc<ServiceRegistry>) -> FetchResult<Catalog> {
    let data: Value = serde_json::from_str(SWAPI_DATA)
        .map_err(|e| FetchError::config(format!("invalid bundled data: {}", e)))?;
    Catalog::from_json(registry, &data)
}

/// An in-process transport serving the bundled catalog.
pub fn transport() -> FetchResult<InMemoryTransport> {
    let registry = Arc::new(registry()?);
    Ok(InMemoryTransport::new(Arc::new(catalog(registry)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_services_compose() {
        let registry = registry().unwrap();
        assert_eq!(registry.services().len(), 6);
        assert_eq!(
            registry.relation("Film", "characters").unwrap().service,
            PERSON_SERVICE
        );
        assert_eq!(
            registry.relation("Person", "homeworld").unwrap().service,
            PLANET_SERVICE
        );
    }

    #[test]
    fn bundled_catalog_loads_every_type() {
        let catalog = catalog(Arc::new(registry().unwrap())).unwrap();
        assert_eq!(catalog.len("Film"), 3);
        assert_eq!(catalog.len("Person"), 8);
        assert_eq!(catalog.len("Planet"), 7);
        assert!(!catalog.is_empty());
    }
}

//! Endpoint repository contract
//!
//! Persistence is someone else's problem; serving needs route uniqueness and
//! a compare-and-swap update. The `revision` counter on each record is the
//! optimistic lock that turns the `deploying` status into a real lease.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use llmops_common::{Error, Result};

use crate::endpoint::{Environment, ServingEndpoint};

/// Storage for endpoint records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Insert a new record; fails with `Validation` when the
    /// `(environment, route)` pair is taken
    async fn insert(&self, endpoint: ServingEndpoint) -> Result<ServingEndpoint>;

    /// Fetch by id
    async fn get(&self, id: &Uuid) -> Result<Option<ServingEndpoint>>;

    /// Fetch by `(environment, route)`
    async fn find_by_route(
        &self,
        environment: Environment,
        route: &str,
    ) -> Result<Option<ServingEndpoint>>;

    /// All records, optionally in one environment
    async fn list(&self, environment: Option<Environment>) -> Result<Vec<ServingEndpoint>>;

    /// Write a record whose `revision` matches the stored one.
    ///
    /// Returns the stored record with its bumped revision, or
    /// [`Error::StaleRevision`] when someone else wrote first.
    async fn update(&self, endpoint: &ServingEndpoint) -> Result<ServingEndpoint>;

    /// Remove a record; `false` when it did not exist
    async fn delete(&self, id: &Uuid) -> Result<bool>;
}

type RouteKey = (Environment, String);

/// Repository held in memory
#[derive(Default)]
pub struct InMemoryEndpointRepository {
    endpoints: DashMap<Uuid, ServingEndpoint>,
    routes: DashMap<RouteKey, Uuid>,
}

impl InMemoryEndpointRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository preloaded with records, e.g. from a state file
    pub fn from_records(records: impl IntoIterator<Item = ServingEndpoint>) -> Self {
        let repo = Self::new();
        for record in records {
            repo.routes
                .insert((record.environment, record.route.clone()), record.id);
            repo.endpoints.insert(record.id, record);
        }
        repo
    }

    /// Snapshot of every record, ordered by creation time
    pub fn records(&self) -> Vec<ServingEndpoint> {
        let mut all: Vec<ServingEndpoint> = self.endpoints.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|e| e.created_at);
        all
    }
}

fn route_taken(endpoint: &ServingEndpoint) -> Error {
    Error::validation_for_field(
        endpoint.id.to_string(),
        "route",
        format!("route {} is already in use", endpoint.route_key()),
    )
}

#[async_trait]
impl EndpointRepository for InMemoryEndpointRepository {
    async fn insert(&self, endpoint: ServingEndpoint) -> Result<ServingEndpoint> {
        let key = (endpoint.environment, endpoint.route.clone());
        // the route guard is released before `endpoints` is locked; only
        // `update` holds both, always endpoints first
        match self.routes.entry(key) {
            Entry::Occupied(_) => return Err(route_taken(&endpoint)),
            Entry::Vacant(slot) => {
                slot.insert(endpoint.id);
            }
        }
        self.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ServingEndpoint>> {
        Ok(self.endpoints.get(id).map(|e| e.clone()))
    }

    async fn find_by_route(
        &self,
        environment: Environment,
        route: &str,
    ) -> Result<Option<ServingEndpoint>> {
        let id = self
            .routes
            .get(&(environment, route.to_string()))
            .map(|id| *id);
        Ok(id.and_then(|id| self.endpoints.get(&id).map(|e| e.clone())))
    }

    async fn list(&self, environment: Option<Environment>) -> Result<Vec<ServingEndpoint>> {
        Ok(self
            .records()
            .into_iter()
            .filter(|e| environment.map_or(true, |env| e.environment == env))
            .collect())
    }

    async fn update(&self, endpoint: &ServingEndpoint) -> Result<ServingEndpoint> {
        let Some(mut stored) = self.endpoints.get_mut(&endpoint.id) else {
            return Err(Error::not_found("endpoint", endpoint.id.to_string()));
        };
        if stored.revision != endpoint.revision {
            return Err(Error::StaleRevision {
                id: endpoint.id.to_string(),
                expected: endpoint.revision,
                found: stored.revision,
            });
        }

        let old_key = (stored.environment, stored.route.clone());
        let new_key = (endpoint.environment, endpoint.route.clone());
        if old_key != new_key {
            match self.routes.entry(new_key) {
                Entry::Occupied(_) => return Err(route_taken(endpoint)),
                Entry::Vacant(slot) => {
                    slot.insert(endpoint.id);
                }
            }
            self.routes.remove(&old_key);
        }

        let mut next = endpoint.clone();
        next.revision = endpoint.revision + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool> {
        match self.endpoints.remove(id) {
            Some((_, removed)) => {
                self.routes.remove(&(removed.environment, removed.route));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

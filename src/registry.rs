/*!
 * Server registry
 *
 * Authoritative in-memory map of backend servers, their declared
 * capabilities and their live health/latency metadata. Records live in a
 * sharded map keyed by id and a second sharded index maps each capability
 * to the ids declaring it, so candidate lookups and per-record writes from
 * the health monitor never serialize on one lock.
 *
 * Register and deregister write through to the configured
 * [`RegistryStore`](crate::store::RegistryStore) before the in-memory state
 * changes; a failed write leaves the registry untouched.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use switchyard_core_resilience::ShardedMap;
use tracing::{debug, info};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::store::RegistryStore;

/// Weight given to the newest sample in the response time average
const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.2;

/// Tag consulted for the balancing weight when none was declared
pub const WEIGHT_TAG: &str = "weight";

/// Largest balancing weight a server may declare
pub const MAX_WEIGHT: u32 = 1000;

/// Liveness as last observed by the health monitor or the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }

    /// Whether the router may select a server in this state
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthState::Healthy),
            "degraded" => Ok(HealthState::Degraded),
            "unhealthy" => Ok(HealthState::Unhealthy),
            "unknown" => Ok(HealthState::Unknown),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown health state '{other}'"
            ))),
        }
    }
}

/// Wire transport used to reach a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Newline-delimited JSON-RPC over a TCP stream
    Tcp,
    /// JSON-RPC POSTed over HTTP(S)
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// Syntactically validated backend address
///
/// Accepted forms are `tcp://host:port` and `http(s)://host[:port]/path`.
/// Reachability is never checked here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    url: Url,
    transport: TransportKind,
}

impl Endpoint {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| GatewayError::InvalidEndpoint {
            endpoint: input.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;
        let transport = match url.scheme() {
            "tcp" => TransportKind::Tcp,
            "http" | "https" => TransportKind::Http,
            _ => return Err(invalid("scheme must be tcp, http or https")),
        };
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        if transport == TransportKind::Tcp && url.port().is_none() {
            return Err(invalid("tcp endpoints need an explicit port"));
        }
        Ok(Self { url, transport })
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` for socket connects
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.url.to_string()
    }
}

/// One registered backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub endpoint: Endpoint,
    pub capabilities: BTreeSet<String>,
    /// `None` means visible to every tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub avg_response_time_ms: f64,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Declared balancing weight
    #[serde(default)]
    pub weight: Option<u32>,
    pub registered_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Balancing weight: declared weight, else the `weight` tag, else 1
    ///
    /// Always within `1..=MAX_WEIGHT`.
    pub fn effective_weight(&self) -> u32 {
        self.weight
            .or_else(|| self.tags.get(WEIGHT_TAG).and_then(|w| w.parse().ok()))
            .unwrap_or(1)
            .clamp(1, MAX_WEIGHT)
    }

    pub fn serves(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Globally visible, or scoped to `tenant`
    pub fn visible_to(&self, tenant: Option<&str>) -> bool {
        match &self.tenant_id {
            None => true,
            Some(owner) => tenant == Some(owner.as_str()),
        }
    }
}

/// Registration request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServerSpec {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            endpoint: endpoint.into(),
            capabilities: Vec::new(),
            tenant_id: None,
            tags: BTreeMap::new(),
            weight: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Validate and build a fresh record with unknown health
    pub fn into_record(self) -> Result<ServerRecord> {
        let endpoint = Endpoint::parse(&self.endpoint)?;

        let id = match self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(GatewayError::InvalidRequest(
                    "server id must not be empty".to_string(),
                ))
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if self.capabilities.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "server '{id}' declares no capabilities"
            )));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(format!(
                "server '{id}' declares an empty capability name"
            )));
        }
        match self.weight {
            Some(0) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "server '{id}' weight must be at least 1"
                )))
            }
            Some(weight) if weight > MAX_WEIGHT => {
                return Err(GatewayError::InvalidRequest(format!(
                    "server '{id}' weight {weight} exceeds the maximum of {MAX_WEIGHT}"
                )))
            }
            _ => {}
        }

        Ok(ServerRecord {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            endpoint,
            capabilities: self.capabilities.into_iter().collect(),
            tenant_id: self.tenant_id,
            health: HealthState::Unknown,
            avg_response_time_ms: 0.0,
            last_health_check: None,
            tags: self.tags,
            weight: self.weight,
            registered_at: Utc::now(),
        })
    }
}

/// Criteria for [`Registry::list`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub capability: Option<String>,
    /// Only servers visible to this tenant
    pub tenant: Option<String>,
    pub health: Option<HealthState>,
    pub tag: Option<(String, String)>,
}

impl ServerFilter {
    pub fn matches(&self, record: &ServerRecord) -> bool {
        self.capability.as_deref().map_or(true, |c| record.serves(c))
            && self
                .tenant
                .as_deref()
                .map_or(true, |t| record.visible_to(Some(t)))
            && self.health.map_or(true, |h| record.health == h)
            && self
                .tag
                .as_ref()
                .map_or(true, |(k, v)| record.tags.get(k) == Some(v))
    }
}

/// Sharded registry of backend servers
pub struct Registry {
    servers: ShardedMap<ServerRecord>,
    /// capability -> ids declaring it
    by_capability: ShardedMap<BTreeSet<String>>,
    /// name -> id; also serializes register/deregister
    names: Mutex<HashMap<String, String>>,
    store: Option<Arc<dyn RegistryStore>>,
}

impl Registry {
    /// Registry without persistence
    pub fn new() -> Self {
        Self {
            servers: ShardedMap::new(),
            by_capability: ShardedMap::new(),
            names: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry writing registrations through to `store`
    pub fn with_store(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a server, returning its id
    ///
    /// Fails with [`GatewayError::DuplicateName`] if the id or the name is
    /// already taken; existing state is not touched.
    ///
    /// The store write happens on the calling thread under the name index
    /// lock, which dispatch never takes. Async callers run this on the
    /// blocking pool (see [`Gateway::register`](crate::Gateway::register)).
    pub fn register(&self, spec: ServerSpec) -> Result<String> {
        let record = spec.into_record()?;
        self.insert(record, true)
    }

    /// Re-insert a record loaded from the store without writing it back
    pub fn restore(&self, record: ServerRecord) -> Result<String> {
        self.insert(record, false)
    }

    fn insert(&self, record: ServerRecord, persist: bool) -> Result<String> {
        let mut names = self.names();
        if self.servers.contains_key(&record.id) {
            return Err(GatewayError::DuplicateName(record.id));
        }
        if names.contains_key(&record.name) {
            return Err(GatewayError::DuplicateName(record.name));
        }
        if persist {
            if let Some(store) = &self.store {
                store.upsert(&record)?;
            }
        }

        let id = record.id.clone();
        names.insert(record.name.clone(), id.clone());
        for capability in &record.capabilities {
            self.by_capability.with_entry(capability, |map| {
                map.entry(capability.clone())
                    .or_default()
                    .insert(id.clone());
            });
        }
        info!(
            server_id = %id,
            endpoint = %record.endpoint,
            capabilities = record.capabilities.len(),
            "Server registered"
        );
        self.servers.insert(id.clone(), record);
        Ok(id)
    }

    /// Remove a server and return its final record
    pub fn deregister(&self, id: &str) -> Result<ServerRecord> {
        let mut names = self.names();
        if !self.servers.contains_key(id) {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        if let Some(store) = &self.store {
            store.remove(id)?;
        }
        let record = self
            .servers
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;

        names.remove(&record.name);
        for capability in &record.capabilities {
            self.by_capability.with_entry(capability, |map| {
                if let Some(ids) = map.get_mut(capability) {
                    ids.remove(id);
                    if ids.is_empty() {
                        map.remove(capability);
                    }
                }
            });
        }
        info!(server_id = %id, "Server deregistered");
        Ok(record)
    }

    /// Whether any server at all declares `capability`
    pub fn has_capability(&self, capability: &str) -> bool {
        self.by_capability
            .with(capability, |ids| ids.is_some_and(|ids| !ids.is_empty()))
    }

    /// Routable servers declaring `capability` that `tenant` may see
    ///
    /// Unhealthy servers are never returned. Ordered by id.
    pub fn candidates_for(&self, capability: &str, tenant: Option<&str>) -> Vec<ServerRecord> {
        let ids = self
            .by_capability
            .with(capability, |ids| ids.cloned().unwrap_or_default());
        ids.iter()
            .filter_map(|id| self.servers.get_cloned(id))
            .filter(|r| r.serves(capability) && r.visible_to(tenant) && r.health.is_routable())
            .collect()
    }

    /// Visible servers declaring `capability`, whatever their health
    pub fn declared_for(&self, capability: &str, tenant: Option<&str>) -> Vec<ServerRecord> {
        let ids = self
            .by_capability
            .with(capability, |ids| ids.cloned().unwrap_or_default());
        ids.iter()
            .filter_map(|id| self.servers.get_cloned(id))
            .filter(|r| r.visible_to(tenant))
            .collect()
    }

    /// Record a health observation, folding `response_time_ms` into the average
    pub fn update_health(
        &self,
        id: &str,
        health: HealthState,
        response_time_ms: Option<f64>,
    ) -> Result<()> {
        self.servers.with_mut(id, |record| {
            let record = record.ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
            if record.health != health {
                debug!(server_id = %id, from = %record.health, to = %health, "Health changed");
            }
            record.health = health;
            record.last_health_check = Some(Utc::now());
            if let Some(ms) = response_time_ms {
                fold_response_time(record, ms);
            }
            Ok(())
        })
    }

    /// Fold a live call latency into the average without touching health
    pub fn record_response_time(&self, id: &str, response_time_ms: f64) {
        self.servers.with_mut(id, |record| {
            if let Some(record) = record {
                fold_response_time(record, response_time_ms);
            }
        });
    }

    /// Immediate feedback after a transport failure: healthy becomes degraded
    pub fn report_transport_failure(&self, id: &str) {
        self.servers.with_mut(id, |record| {
            if let Some(record) = record {
                if matches!(record.health, HealthState::Healthy | HealthState::Unknown) {
                    record.health = HealthState::Degraded;
                }
            }
        });
    }

    pub fn get(&self, id: &str) -> Result<ServerRecord> {
        self.servers
            .get_cloned(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn health_of(&self, id: &str) -> Option<HealthState> {
        self.servers.with(id, |r| r.map(|r| r.health))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    /// Servers matching `filter`, ordered by id
    pub fn list(&self, filter: &ServerFilter) -> Vec<ServerRecord> {
        let mut records: Vec<_> = self
            .servers
            .values()
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.servers.len());
        self.servers.for_each(|id, _| ids.push(id.to_string()));
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn fold_response_time(record: &mut ServerRecord, ms: f64) {
    if !ms.is_finite() || ms < 0.0 {
        return;
    }
    record.avg_response_time_ms = if record.avg_response_time_ms == 0.0 {
        ms
    } else {
        RESPONSE_TIME_EWMA_ALPHA * ms + (1.0 - RESPONSE_TIME_EWMA_ALPHA) * record.avg_response_time_ms
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};

    fn spec(id: &str, capability: &str) -> ServerSpec {
        ServerSpec::new(format!("tcp://127.0.0.1:{}", 9000 + id.len()))
            .with_id(id)
            .with_capability(capability)
    }

    #[test]
    fn test_endpoint_parsing() {
        let tcp = Endpoint::parse("tcp://127.0.0.1:7000").unwrap();
        assert_eq!(tcp.transport(), TransportKind::Tcp);
        assert_eq!(tcp.authority(), "127.0.0.1:7000");

        let http = Endpoint::parse("https://mcp.example.com/rpc").unwrap();
        assert_eq!(http.transport(), TransportKind::Http);
        assert_eq!(http.authority(), "mcp.example.com:443");

        for bad in ["not a url", "tcp://localhost", "ftp://host:21", "tcp://:80"] {
            assert!(
                matches!(Endpoint::parse(bad), Err(GatewayError::InvalidEndpoint { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        let id = registry
            .register(spec("a", "search").with_name("alpha").with_weight(3))
            .unwrap();
        assert_eq!(id, "a");

        let record = registry.get("a").unwrap();
        assert_eq!(record.name, "alpha");
        assert_eq!(record.health, HealthState::Unknown);
        assert_eq!(record.effective_weight(), 3);
        assert!(registry.has_capability("search"));
        assert!(!registry.has_capability("fetch"));
    }

    #[test]
    fn test_generated_id() {
        let registry = Registry::new();
        let id = registry
            .register(ServerSpec::new("http://localhost:8080/mcp").with_capability("x"))
            .unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(registry.get(&id).unwrap().name, id);
    }

    #[test]
    fn test_duplicate_registration_leaves_state() {
        let registry = Registry::new();
        registry.register(spec("a", "search").with_name("alpha")).unwrap();

        let dup_id = registry.register(spec("a", "fetch").with_name("other"));
        assert!(matches!(dup_id, Err(GatewayError::DuplicateName(ref n)) if n == "a"));

        let dup_name = registry.register(spec("b", "fetch").with_name("alpha"));
        assert!(matches!(dup_name, Err(GatewayError::DuplicateName(ref n)) if n == "alpha"));

        assert_eq!(registry.len(), 1);
        assert!(!registry.has_capability("fetch"));
        assert!(registry.get("a").unwrap().serves("search"));
    }

    #[test]
    fn test_deregister_unknown() {
        let registry = Registry::new();
        assert!(matches!(
            registry.deregister("ghost"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn test_deregister_cleans_indexes() {
        let registry = Registry::new();
        registry.register(spec("a", "search").with_name("alpha")).unwrap();
        registry.deregister("a").unwrap();

        assert!(registry.is_empty());
        assert!(!registry.has_capability("search"));
        // name is free again
        registry.register(spec("b", "search").with_name("alpha")).unwrap();
    }

    #[test]
    fn test_candidates_respect_tenant_and_health() {
        let registry = Registry::new();
        registry.register(spec("global", "search")).unwrap();
        registry
            .register(spec("mine", "search").with_tenant("acme"))
            .unwrap();
        registry
            .register(spec("theirs", "search").with_tenant("globex"))
            .unwrap();
        registry.register(spec("sick", "search")).unwrap();
        registry
            .update_health("sick", HealthState::Unhealthy, None)
            .unwrap();

        let ids = |c: Vec<ServerRecord>| c.into_iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(
            ids(registry.candidates_for("search", Some("acme"))),
            vec!["global", "mine"]
        );
        assert_eq!(ids(registry.candidates_for("search", None)), vec!["global"]);
        assert!(registry.candidates_for("fetch", Some("acme")).is_empty());
        assert_eq!(registry.declared_for("search", None).len(), 2);
    }

    #[test]
    fn test_response_time_ewma() {
        let registry = Registry::new();
        registry.register(spec("a", "search")).unwrap();
        registry
            .update_health("a", HealthState::Healthy, Some(100.0))
            .unwrap();
        assert_eq!(registry.get("a").unwrap().avg_response_time_ms, 100.0);

        registry.record_response_time("a", 200.0);
        let avg = registry.get("a").unwrap().avg_response_time_ms;
        assert!((avg - 120.0).abs() < 1e-9);
        assert!(registry.get("a").unwrap().last_health_check.is_some());
    }

    #[test]
    fn test_transport_failure_degrades() {
        let registry = Registry::new();
        registry.register(spec("a", "search")).unwrap();
        registry.update_health("a", HealthState::Healthy, None).unwrap();
        registry.report_transport_failure("a");
        assert_eq!(registry.health_of("a"), Some(HealthState::Degraded));
    }

    #[test]
    fn test_list_filter() {
        let registry = Registry::new();
        registry
            .register(spec("b", "search").with_tag("region", "eu"))
            .unwrap();
        registry
            .register(spec("a", "fetch").with_tag("region", "us"))
            .unwrap();

        let all = registry.list(&ServerFilter::default());
        assert_eq!(all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let eu = registry.list(&ServerFilter {
            tag: Some(("region".into(), "eu".into())),
            ..Default::default()
        });
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].id, "b");
    }

    #[test]
    fn test_write_through_store() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::with_store(store.clone());
        registry.register(spec("a", "search")).unwrap();
        assert_eq!(store.len(), 1);
        registry.update_health("a", HealthState::Healthy, None).unwrap();
        assert_eq!(store.load().unwrap()[0].health, HealthState::Unknown);
        registry.deregister("a").unwrap();
        assert!(store.is_empty());
    }

    struct FailingStore;

    impl RegistryStore for FailingStore {
        fn load(&self) -> std::result::Result<Vec<ServerRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn upsert(&self, _: &ServerRecord) -> std::result::Result<(), StoreError> {
            Err(StoreError::Io {
                path: "registry.json".into(),
                source: std::io::Error::other("disk full"),
            })
        }
        fn remove(&self, _: &str) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_store_write_leaves_registry_untouched() {
        let registry = Registry::with_store(Arc::new(FailingStore));
        let err = registry.register(spec("a", "search")).unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
        assert!(registry.is_empty());
        assert!(!registry.has_capability("search"));
    }

    #[test]
    fn test_spec_validation() {
        assert!(ServerSpec::new("tcp://h:1").into_record().is_err());
        assert!(ServerSpec::new("tcp://h:1")
            .with_capability("x")
            .with_weight(0)
            .into_record()
            .is_err());
        assert!(ServerSpec::new("tcp://h:1")
            .with_id(" ")
            .with_capability("x")
            .into_record()
            .is_err());
        assert!(ServerSpec::new("tcp://h:1")
            .with_capability("x")
            .with_weight(MAX_WEIGHT)
            .into_record()
            .is_ok());
        assert!(matches!(
            ServerSpec::new("tcp://h:1")
                .with_capability("x")
                .with_weight(MAX_WEIGHT + 1)
                .into_record(),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_weight_tag_fallback() {
        let record = ServerSpec::new("tcp://h:1")
            .with_capability("x")
            .with_tag(WEIGHT_TAG, "4")
            .into_record()
            .unwrap();
        assert_eq!(record.effective_weight(), 4);

        let record = ServerSpec::new("tcp://h:1")
            .with_capability("x")
            .with_tag(WEIGHT_TAG, "4000000000")
            .into_record()
            .unwrap();
        assert_eq!(record.effective_weight(), MAX_WEIGHT);
    }
}

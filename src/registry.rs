//! Endpoint registry.
//!
//! Tenant-scoped endpoint configuration. Validation runs before anything is
//! persisted; scheduling is the caller's concern.

use crate::db::{DbError, Endpoint, Store};

use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Shortest allowed probe interval.
pub const MIN_INTERVAL_SECS: u32 = 5;
const MAX_NAME_LEN: usize = 100;

/// Malformed endpoint configuration. Names the offending field.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("endpoint not found")]
    NotFound,
    #[error("an endpoint with this name already exists")]
    DuplicateName,
    #[error("endpoint has retained history and cannot be deleted")]
    RetentionLocked,
    #[error("store error: {0}")]
    Store(DbError),
}

impl From<DbError> for RegistryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => RegistryError::NotFound,
            DbError::Conflict(_) => RegistryError::DuplicateName,
            other => RegistryError::Store(other),
        }
    }
}

fn default_expected_status() -> u16 {
    200
}

/// Fields for a new endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEndpoint {
    pub name: String,
    pub url: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub interval_secs: Option<u32>,
    pub timeout_secs: Option<u32>,
    pub expected_status: Option<u16>,
    pub is_active: Option<bool>,
}

/// Check an endpoint configuration.
pub fn validate_endpoint(endpoint: &Endpoint) -> Result<(), ValidationError> {
    if endpoint.tenant_id.trim().is_empty() {
        return Err(ValidationError::new("tenant_id", "must not be empty"));
    }

    let name = endpoint.name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }

    let url = Url::parse(&endpoint.url)
        .map_err(|e| ValidationError::new("url", format!("not an absolute URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::new("url", "scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new("url", "missing host"));
    }

    if endpoint.interval_secs < MIN_INTERVAL_SECS {
        return Err(ValidationError::new(
            "interval_secs",
            format!("must be at least {} seconds", MIN_INTERVAL_SECS),
        ));
    }
    if endpoint.timeout_secs == 0 {
        return Err(ValidationError::new("timeout_secs", "must be positive"));
    }
    if endpoint.timeout_secs >= endpoint.interval_secs {
        return Err(ValidationError::new(
            "timeout_secs",
            "must be shorter than interval_secs",
        ));
    }

    if !(100..=599).contains(&endpoint.expected_status) {
        return Err(ValidationError::new(
            "expected_status",
            "must be an HTTP status code (100-599)",
        ));
    }

    Ok(())
}

/// Endpoint CRUD bound to the persistence store.
pub struct Registry {
    store: Arc<Store>,
    immutable_retention: bool,
}

impl Registry {
    pub fn new(store: Arc<Store>, immutable_retention: bool) -> Self {
        Self {
            store,
            immutable_retention,
        }
    }

    pub fn create(&self, tenant_id: &str, new: NewEndpoint) -> Result<Endpoint, RegistryError> {
        let mut endpoint = Endpoint {
            id: 0,
            tenant_id: tenant_id.to_string(),
            name: new.name.trim().to_string(),
            url: new.url.trim().to_string(),
            interval_secs: new.interval_secs,
            timeout_secs: new.timeout_secs,
            expected_status: new.expected_status,
            is_active: true,
            created_at: Utc::now(),
        };
        validate_endpoint(&endpoint)?;
        self.store.add_endpoint(&mut endpoint)?;
        tracing::info!(
            tenant = %endpoint.tenant_id,
            endpoint_id = endpoint.id,
            "Registry: created endpoint {}",
            endpoint.name
        );
        Ok(endpoint)
    }

    pub fn get(&self, tenant_id: &str, id: i64) -> Result<Endpoint, RegistryError> {
        Ok(self.store.get_endpoint(tenant_id, id)?)
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<Endpoint>, RegistryError> {
        Ok(self.store.list_endpoints(tenant_id)?)
    }

    pub fn update(&self, tenant_id: &str, id: i64, patch: EndpointPatch) -> Result<Endpoint, RegistryError> {
        let mut endpoint = self.store.get_endpoint(tenant_id, id)?;
        if let Some(name) = patch.name {
            endpoint.name = name.trim().to_string();
        }
        if let Some(url) = patch.url {
            endpoint.url = url.trim().to_string();
        }
        if let Some(interval) = patch.interval_secs {
            endpoint.interval_secs = interval;
        }
        if let Some(timeout) = patch.timeout_secs {
            endpoint.timeout_secs = timeout;
        }
        if let Some(expected) = patch.expected_status {
            endpoint.expected_status = expected;
        }
        if let Some(active) = patch.is_active {
            endpoint.is_active = active;
        }

        validate_endpoint(&endpoint)?;
        self.store.update_endpoint(&endpoint)?;
        Ok(endpoint)
    }

    /// Soft-disable: history and outages stay, probing stops.
    pub fn deactivate(&self, tenant_id: &str, id: i64) -> Result<Endpoint, RegistryError> {
        let mut endpoint = self.store.get_endpoint(tenant_id, id)?;
        if endpoint.is_active {
            endpoint.is_active = false;
            self.store.update_endpoint(&endpoint)?;
            tracing::info!(tenant = %tenant_id, endpoint_id = id, "Registry: deactivated endpoint");
        }
        Ok(endpoint)
    }

    /// Hard delete with cascade, or rejection when history is retained.
    pub fn delete(&self, tenant_id: &str, id: i64) -> Result<(), RegistryError> {
        if self.immutable_retention && self.store.endpoint_history_count(tenant_id, id)? > 0 {
            return Err(RegistryError::RetentionLocked);
        }
        self.store.delete_endpoint(tenant_id, id)?;
        tracing::info!(tenant = %tenant_id, endpoint_id = id, "Registry: deleted endpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::CheckStatus;

    fn new_endpoint(name: &str) -> NewEndpoint {
        NewEndpoint {
            name: name.to_string(),
            url: "https://api.example.com/health".to_string(),
            interval_secs: 60,
            timeout_secs: 10,
            expected_status: 200,
        }
    }

    fn field_of(err: RegistryError) -> &'static str {
        match err {
            RegistryError::Validation(v) => v.field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_names_field() {
        let (store, _tmp) = temp_store();
        let registry = Registry::new(Arc::new(store), false);

        let mut bad = new_endpoint("api");
        bad.url = "/relative/path".to_string();
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "url");

        let mut bad = new_endpoint("api");
        bad.url = "ftp://example.com".to_string();
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "url");

        let mut bad = new_endpoint("api");
        bad.interval_secs = 4;
        bad.timeout_secs = 2;
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "interval_secs");

        let mut bad = new_endpoint("api");
        bad.timeout_secs = 60;
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "timeout_secs");

        let mut bad = new_endpoint("  ");
        bad.name = "  ".to_string();
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "name");

        let mut bad = new_endpoint("api");
        bad.expected_status = 42;
        assert_eq!(field_of(registry.create("acme", bad).unwrap_err()), "expected_status");

        assert!(registry.list("acme").unwrap().is_empty());
    }

    #[test]
    fn test_create_update_deactivate() {
        let (store, _tmp) = temp_store();
        let registry = Registry::new(Arc::new(store), false);

        let created = registry.create("acme", new_endpoint("api")).unwrap();
        assert!(created.is_active);

        let patch = EndpointPatch {
            interval_secs: Some(30),
            ..Default::default()
        };
        let updated = registry.update("acme", created.id, patch).unwrap();
        assert_eq!(updated.interval_secs, 30);
        assert_eq!(updated.timeout_secs, 10);

        // A patch that breaks timeout < interval is rejected and not stored.
        let patch = EndpointPatch {
            timeout_secs: Some(30),
            ..Default::default()
        };
        assert_eq!(field_of(registry.update("acme", created.id, patch).unwrap_err()), "timeout_secs");
        assert_eq!(registry.get("acme", created.id).unwrap().timeout_secs, 10);

        let inactive = registry.deactivate("acme", created.id).unwrap();
        assert!(!inactive.is_active);
        assert!(matches!(registry.deactivate("globex", created.id), Err(RegistryError::NotFound)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (store, _tmp) = temp_store();
        let registry = Registry::new(Arc::new(store), false);
        registry.create("acme", new_endpoint("api")).unwrap();
        assert!(matches!(
            registry.create("acme", new_endpoint("api")),
            Err(RegistryError::DuplicateName)
        ));
    }

    #[test]
    fn test_delete_respects_immutable_retention() {
        let (store, _tmp) = temp_store();
        let store = Arc::new(store);
        let locked = Registry::new(store.clone(), true);

        let endpoint = locked.create("acme", new_endpoint("api")).unwrap();
        let fresh = locked.create("acme", new_endpoint("fresh")).unwrap();
        store
            .add_health_check(&mut sample_check(&endpoint, CheckStatus::Up, Utc::now(), Some(5)))
            .unwrap();

        assert!(matches!(locked.delete("acme", endpoint.id), Err(RegistryError::RetentionLocked)));
        // No history yet, so deletion is allowed.
        locked.delete("acme", fresh.id).unwrap();

        let cascading = Registry::new(store.clone(), false);
        cascading.delete("acme", endpoint.id).unwrap();
        assert_eq!(store.endpoint_history_count("acme", endpoint.id).unwrap(), 0);
    }
}

//! Provider registry mapping engine names to dialects and adapters.
//!
//! [`DriverCatalog`] is a plain map that can be built and tested in isolation.
//! The process-wide registry used by [`BulkExecutor`](crate::bulk::BulkExecutor)
//! is one `DriverCatalog` behind a mutex, filled at startup through
//! [`register`] / [`try_register`] and read on every operation.
//!
//! Keys are normalized provider identifiers: the last dot-separated segment of a
//! fully qualified provider name, so `Microsoft.EntityFrameworkCore.SqlServer`
//! resolves the `SqlServer` entry.
//!
//! # Collision policy
//!
//! Entries are insert-only. [`register`] rejects a name that is already present;
//! [`try_register`] leaves the existing entry in place and reports `false`. Both
//! reject an empty name with [`BulkError::Registry`]. An
//! entry can therefore never be swapped under an in-flight operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::error::{BulkError, Result};

use super::traits::{Dialect, SqlOperationsAdapter};

/// One registered engine.
#[derive(Clone)]
pub struct ProviderEntry {
    pub adapter: Arc<dyn SqlOperationsAdapter>,
    pub dialect: Arc<dyn Dialect>,
}

/// Registry of engine dialects and adapters keyed by normalized provider name.
#[derive(Default)]
pub struct DriverCatalog {
    providers: HashMap<String, ProviderEntry>,
}

impl DriverCatalog {
    /// Create a new empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine, rejecting empty names and names already present.
    pub fn register(
        &mut self,
        name: &str,
        adapter: Arc<dyn SqlOperationsAdapter>,
        dialect: Arc<dyn Dialect>,
    ) -> Result<()> {
        if !self.try_register(name, adapter, dialect)? {
            return Err(BulkError::Registry(format!(
                "Provider mapping already registered for {}",
                provider_key(name)
            )));
        }
        Ok(())
    }

    /// Register an engine unless the name is taken. Returns whether it was added.
    ///
    /// A taken name is not an error; an empty one is.
    pub fn try_register(
        &mut self,
        name: &str,
        adapter: Arc<dyn SqlOperationsAdapter>,
        dialect: Arc<dyn Dialect>,
    ) -> Result<bool> {
        let key = provider_key(name);
        if key.is_empty() {
            return Err(BulkError::Registry("Provider name cannot be empty".into()));
        }
        if self.providers.contains_key(key) {
            return Ok(false);
        }
        self.providers
            .insert(key.to_string(), ProviderEntry { adapter, dialect });
        Ok(true)
    }

    /// Look up an engine by (possibly fully qualified) provider name.
    pub fn get(&self, provider_name: &str) -> Option<ProviderEntry> {
        self.providers.get(provider_key(provider_name)).cloned()
    }

    /// Look up an engine, returning an error if not found.
    pub fn require(&self, provider_name: &str) -> Result<ProviderEntry> {
        self.get(provider_name).ok_or_else(|| {
            BulkError::Registry(format!(
                "No provider registered for '{}' (key '{}'). Registered: {}",
                provider_name,
                provider_key(provider_name),
                self.provider_names().join(", ")
            ))
        })
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, provider_name: &str) -> bool {
        self.providers.contains_key(provider_key(provider_name))
    }

    /// Get all registered provider keys, sorted.
    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCatalog")
            .field("providers", &self.provider_names())
            .finish()
    }
}

/// Normalize a provider name to its registry key.
pub fn provider_key(provider_name: &str) -> &str {
    provider_name
        .rsplit('.')
        .next()
        .unwrap_or(provider_name)
        .trim()
}

static REGISTRY: Lazy<Mutex<DriverCatalog>> = Lazy::new(|| Mutex::new(DriverCatalog::new()));

fn registry() -> Result<MutexGuard<'static, DriverCatalog>> {
    REGISTRY
        .lock()
        .map_err(|_| BulkError::Registry("provider registry lock poisoned".into()))
}

/// Register an engine in the process-wide registry. Duplicates are rejected.
pub fn register(
    name: &str,
    adapter: Arc<dyn SqlOperationsAdapter>,
    dialect: Arc<dyn Dialect>,
) -> Result<()> {
    registry()?.register(name, adapter, dialect)
}

/// Register an engine in the process-wide registry unless already present.
pub fn try_register(
    name: &str,
    adapter: Arc<dyn SqlOperationsAdapter>,
    dialect: Arc<dyn Dialect>,
) -> Result<bool> {
    registry()?.try_register(name, adapter, dialect)
}

/// Resolve the dialect for a provider name.
pub fn resolve(provider_name: &str) -> Result<Arc<dyn Dialect>> {
    Ok(registry()?.require(provider_name)?.dialect)
}

/// Resolve the adapter for a provider name.
pub fn resolve_adapter(provider_name: &str) -> Result<Arc<dyn SqlOperationsAdapter>> {
    Ok(registry()?.require(provider_name)?.adapter)
}

/// Resolve both halves of a provider entry under one lock.
pub fn resolve_entry(provider_name: &str) -> Result<ProviderEntry> {
    registry()?.require(provider_name)
}

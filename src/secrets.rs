use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::ToolDefinition;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Credential persistence keyed by `(tool name, variable name)`.
pub trait SecretStore: Send + Sync {
    fn get(&self, tool_name: &str, var_name: &str) -> AppResult<Option<String>>;
    fn set(&self, tool_name: &str, var_name: &str, value: &str) -> AppResult<()>;
    fn delete(&self, tool_name: &str, var_name: &str) -> AppResult<()>;
    fn list_all(&self) -> AppResult<Vec<(String, String)>>;
}

/// OS keyring entries under one service, account `"<tool>.<var>"`. The key
/// index lives in the database because keyrings cannot be enumerated
/// portably.
pub struct KeyringSecretStore {
    service: String,
    index: Arc<Database>,
    lock: Mutex<()>,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>, index: Arc<Database>) -> Self {
        Self {
            service: service.into(),
            index,
            lock: Mutex::new(()),
        }
    }

    fn entry(&self, tool_name: &str, var_name: &str) -> AppResult<keyring::Entry> {
        keyring::Entry::new(&self.service, &account_name(tool_name, var_name)).map_err(AppError::from)
    }

    fn guard(&self) -> AppResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| AppError::Internal("keyring mutex poisoned".to_string()))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, tool_name: &str, var_name: &str) -> AppResult<Option<String>> {
        let _guard = self.guard()?;
        match self.entry(tool_name, var_name)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(AppError::from(error)),
        }
    }

    fn set(&self, tool_name: &str, var_name: &str, value: &str) -> AppResult<()> {
        let _guard = self.guard()?;
        self.entry(tool_name, var_name)?.set_password(value)?;
        self.index.record_secret_key(tool_name, var_name)
    }

    fn delete(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        let _guard = self.guard()?;
        match self.entry(tool_name, var_name)?.delete_credential() {
            Ok(_) | Err(keyring::Error::NoEntry) => {}
            Err(error) => return Err(AppError::from(error)),
        }
        self.index.remove_secret_key(tool_name, var_name)
    }

    fn list_all(&self) -> AppResult<Vec<(String, String)>> {
        self.index.list_secret_keys()
    }
}

/// Process-local store for hosts without a keyring, and for tests.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<(String, String), String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> AppResult<std::sync::MutexGuard<'_, BTreeMap<(String, String), String>>> {
        self.values
            .lock()
            .map_err(|_| AppError::Internal("secret store mutex poisoned".to_string()))
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, tool_name: &str, var_name: &str) -> AppResult<Option<String>> {
        Ok(self
            .values()?
            .get(&(tool_name.to_string(), var_name.to_string()))
            .cloned())
    }

    fn set(&self, tool_name: &str, var_name: &str, value: &str) -> AppResult<()> {
        self.values()?
            .insert((tool_name.to_string(), var_name.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        self.values()?
            .remove(&(tool_name.to_string(), var_name.to_string()));
        Ok(())
    }

    fn list_all(&self) -> AppResult<Vec<(String, String)>> {
        Ok(self.values()?.keys().cloned().collect())
    }
}

/// What the rest of the crate uses to read and edit tool secrets.
#[derive(Clone)]
pub struct SecretBridge {
    store: Arc<dyn SecretStore>,
}

impl SecretBridge {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Run-time lookup. Store failures count as "not set".
    pub fn resolve(&self, tool_name: &str, var_name: &str) -> Option<String> {
        match self.store.get(tool_name, var_name) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(tool = %tool_name, var = %var_name, error = %error, "secret lookup failed");
                None
            }
        }
    }

    /// An empty value removes the stored secret.
    pub fn save(&self, tool_name: &str, var_name: &str, value: &str) -> AppResult<()> {
        if value.is_empty() {
            self.store.delete(tool_name, var_name)
        } else {
            self.store.set(tool_name, var_name, value)
        }
    }

    pub fn delete(&self, tool_name: &str, var_name: &str) -> AppResult<()> {
        self.store.delete(tool_name, var_name)
    }

    pub fn stored_keys(&self) -> AppResult<Vec<(String, String)>> {
        self.store.list_all()
    }

    /// Current values for every declared variable of `tool`, empty when unset.
    pub fn values_for(&self, tool: &ToolDefinition) -> BTreeMap<String, String> {
        tool.environment
            .iter()
            .map(|var| {
                (
                    var.name.clone(),
                    self.resolve(&tool.name, &var.name).unwrap_or_default(),
                )
            })
            .collect()
    }
}

fn account_name(tool_name: &str, var_name: &str) -> String {
    format!("{}.{}", tool_name, var_name)
}

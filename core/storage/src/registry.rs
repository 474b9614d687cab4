//! Backend registry for selecting storage by name.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::filesystem::FilesystemStorage;
use crate::memory::MemoryStorage;
use crate::provider::Storage;
use rpmstore_common::{Error, Result};

/// Factory function type for creating backends.
pub type StorageFactory = Box<dyn Fn(Value) -> Result<Arc<dyn Storage>> + Send + Sync>;

/// Uniform backend configuration.
///
/// In JSON this is a single object: `"name"` selects the backend and every
/// other field is passed to that backend's factory, e.g.
/// `{"name": "filesystem", "base_dir": "/var/rpms"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Registered backend name.
    pub name: String,
    /// Backend-specific options.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl StorageConfig {
    /// Config selecting `name` with no options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Map::new(),
        }
    }

    /// Add a backend option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parse a config from JSON.
    ///
    /// # Errors
    /// - `InvalidConfig` if the document is not an object or lacks a string
    ///   `"name"`
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("malformed JSON: {}", e)))?;
        let Value::Object(mut options) = value else {
            return Err(Error::InvalidConfig(
                "storage config must be a JSON object".to_string(),
            ));
        };
        match options.remove("name") {
            Some(Value::String(name)) => Ok(Self { name, options }),
            Some(other) => Err(Error::InvalidConfig(format!(
                "\"name\" must be a string, got: {}",
                other
            ))),
            None => Err(Error::InvalidConfig(
                "storage config requires a \"name\"".to_string(),
            )),
        }
    }
}

/// Registry for storage backend factories.
///
/// Allows dynamic registration and construction of backends by name and
/// configuration, so callers never link against a concrete backend.
pub struct StorageRegistry {
    entries: BTreeMap<String, Registration>,
}

struct Registration {
    factory: StorageFactory,
    /// Option names shown in help text.
    options: Vec<String>,
}

impl StorageRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - `DuplicateBackend` if `name` is already registered; the existing
    ///   factory is kept
    pub fn register(&mut self, name: impl Into<String>, factory: StorageFactory) -> Result<()> {
        self.register_with_options(name, Vec::<String>::new(), factory)
    }

    /// Register a backend factory along with the names of the options it
    /// accepts, for [`describe`](Self::describe).
    ///
    /// # Errors
    /// - `DuplicateBackend` if `name` is already registered
    pub fn register_with_options<I, S>(
        &mut self,
        name: impl Into<String>,
        options: I,
        factory: StorageFactory,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(Error::DuplicateBackend(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        let options = options.into_iter().map(Into::into).collect();
        self.entries.insert(name, Registration { factory, options });
        Ok(())
    }

    /// Construct a backend by name.
    ///
    /// # Errors
    /// - `UnknownBackend` if `name` is not registered; no factory runs
    /// - Whatever the factory returns for invalid configuration
    pub fn create(&self, name: &str, config: Value) -> Result<Arc<dyn Storage>> {
        let entry = self.entries.get(name).ok_or_else(|| {
            Error::UnknownBackend(format!(
                "Backend '{}' is not registered (available: {})",
                name,
                self.backends().join(", ")
            ))
        })?;
        let storage = (entry.factory)(config)?;
        tracing::info!("Created {} storage backend", name);
        Ok(storage)
    }

    /// Construct a backend from a parsed config.
    pub fn create_from_config(&self, config: &StorageConfig) -> Result<Arc<dyn Storage>> {
        self.create(&config.name, Value::Object(config.options.clone()))
    }

    /// Construct a backend from a JSON config string.
    pub fn from_json(&self, json: &str) -> Result<Arc<dyn Storage>> {
        self.create_from_config(&StorageConfig::from_json(json)?)
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Documented option names of a registered backend.
    pub fn options(&self, name: &str) -> Option<&[String]> {
        self.entries.get(name).map(|e| e.options.as_slice())
    }

    /// One-line description of the accepted config, for help text.
    pub fn describe(&self) -> String {
        let backends = self
            .entries
            .iter()
            .map(|(name, entry)| {
                if entry.options.is_empty() {
                    format!("`{}`", name)
                } else {
                    let options = entry
                        .options
                        .iter()
                        .map(|o| format!("`{}`", o))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("`{}` taking {}", name, options)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "A JSON object whose \"name\" key selects a storage backend, plus \
             any options for that backend. Available backends: {}.",
            backends
        )
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a typed constructor as a [`StorageFactory`].
pub fn storage_factory<S, F>(build: F) -> StorageFactory
where
    S: Storage + 'static,
    F: Fn(Value) -> Result<S> + Send + Sync + 'static,
{
    Box::new(move |config: Value| -> Result<Arc<dyn Storage>> {
        let storage = build(config)?;
        Ok(Arc::new(storage))
    })
}

/// Create a registry with the built-in backends.
///
/// - `filesystem`: `{"base_dir": "<path>"}`
/// - `memory`: no options
pub fn default_registry() -> StorageRegistry {
    let mut entries = BTreeMap::new();

    entries.insert(
        "filesystem".to_string(),
        Registration {
            factory: storage_factory(FilesystemStorage::from_config),
            options: vec!["base_dir".to_string()],
        },
    );
    entries.insert(
        "memory".to_string(),
        Registration {
            factory: storage_factory(MemoryStorage::from_config),
            options: Vec::new(),
        },
    );

    StorageRegistry { entries }
}

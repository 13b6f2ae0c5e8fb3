//! Compilation cache for the guest runtime image.
//!
//! Compiling the interpreter is by far the most expensive part of creating an
//! executor. Every executor owns a private [`Engine`] and [`Module`], so the
//! compiled module itself cannot be shared; what is shared is the
//! precompiled artifact, which each engine deserializes cheaply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use tracing::debug;
use wasmtime::{Engine, Module};

use crate::error::{ExecutorError, Result};

/// A thread-safe cache of precompiled runtime artifacts keyed by canonical
/// image path.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    artifacts: RwLock<HashMap<PathBuf, Arc<[u8]>>>,
}

impl ArtifactCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the module at `path` for `engine`, compiling only on a cache miss.
    ///
    /// All engines using the cache must be built by [`engine_config`], so that
    /// an artifact produced by one engine is compatible with the others.
    pub fn load(&self, engine: &Engine, path: impl AsRef<Path>) -> Result<Module> {
        let canonical_path = canonicalize_image(path.as_ref())?;

        let cached = self
            .artifacts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&canonical_path)
            .cloned();

        let artifact = match cached {
            Some(artifact) => {
                debug!(path = %canonical_path.display(), "runtime artifact cache hit");
                artifact
            }
            None => {
                // Compile outside any lock.
                let wasm_bytes = std::fs::read(&canonical_path)?;
                let artifact: Arc<[u8]> = engine
                    .precompile_module(&wasm_bytes)
                    .map_err(|e| {
                        ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
                            "failed to compile module: {}",
                            e
                        ))
                    })?
                    .into();

                let mut artifacts = self.artifacts.write().unwrap_or_else(|e| e.into_inner());
                // Another thread may have compiled while we were.
                Arc::clone(
                    artifacts
                        .entry(canonical_path.clone())
                        .or_insert_with(|| artifact),
                )
            }
        };

        // SAFETY: the artifact was produced by `Engine::precompile_module` in this
        // process with the configuration from `engine_config`, and it is never
        // mutated after insertion.
        unsafe { Module::deserialize(engine, &*artifact) }.map_err(|e| {
            ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
                "failed to load precompiled module: {}",
                e
            ))
        })
    }

    /// Check if an artifact is cached.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        match std::fs::canonicalize(path.as_ref()) {
            Ok(canonical) => self
                .artifacts
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&canonical),
            Err(_) => false,
        }
    }

    /// Remove an artifact from the cache.
    ///
    /// Returns `true` if the artifact was present and removed.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        match std::fs::canonicalize(path.as_ref()) {
            Ok(canonical) => self
                .artifacts
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&canonical)
                .is_some(),
            Err(_) => false,
        }
    }

    /// Clear all cached artifacts.
    pub fn clear(&self) {
        self.artifacts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Get the number of cached artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static GLOBAL_CACHE: LazyLock<ArtifactCache> = LazyLock::new(ArtifactCache::new);

/// Get the process-wide artifact cache used by executors.
pub fn global_cache() -> &'static ArtifactCache {
    &GLOBAL_CACHE
}

/// The engine configuration shared by every executor: fuel metering for the
/// execution step budget and epoch interruption for wall-clock timeouts.
pub fn engine_config() -> wasmtime::Config {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    config
}

/// Create a private engine with [`engine_config`].
pub fn new_engine() -> Result<Engine> {
    Engine::new(&engine_config()).map_err(|e| {
        ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
            "failed to create engine: {}",
            e
        ))
    })
}

/// Compile the module at `path` without touching any cache.
pub fn compile_uncached(engine: &Engine, path: impl AsRef<Path>) -> Result<Module> {
    let canonical_path = canonicalize_image(path.as_ref())?;
    let wasm_bytes = std::fs::read(&canonical_path)?;
    Module::new(engine, &wasm_bytes).map_err(|e| {
        ExecutorError::RuntimeInitializationFailed(anyhow::anyhow!(
            "failed to compile module: {}",
            e
        ))
    })
}

fn canonicalize_image(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecutorError::RuntimeImageNotFound(path.display().to_string())
        } else {
            ExecutorError::Io(e)
        }
    })
}

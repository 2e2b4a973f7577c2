//! Symbol dispatch: function name to sink entry point.
//!
//! Each device owns a table. Functions registered in-process take
//! precedence; otherwise the device's libraries are searched in
//! configuration order. Successful library lookups are cached.

use crate::error::{DispatchError, DispatchResult};
use crate::loader::SinkLibrary;
use crate::sink::SinkThunk;
use crate::sync::RecoverMutex;
use lib_types::MAX_FUNC_NAME_SIZE;
use std::collections::HashMap;
use std::sync::Mutex;

/// Validate a sink function name.
///
/// Names must be non-empty, fit in [`MAX_FUNC_NAME_SIZE`] bytes including a
/// terminating NUL, and not contain NUL themselves.
pub fn validate_function_name(name: &str) -> DispatchResult<()> {
    if name.is_empty() {
        return Err(DispatchError::invalid_parameter(
            "function",
            "name is empty",
        ));
    }
    if name.len() >= MAX_FUNC_NAME_SIZE {
        return Err(DispatchError::invalid_parameter(
            "function",
            format!(
                "name is {} bytes, must be shorter than {}",
                name.len(),
                MAX_FUNC_NAME_SIZE
            ),
        ));
    }
    if name.contains('\0') {
        return Err(DispatchError::invalid_parameter(
            "function",
            "name contains a NUL byte",
        ));
    }
    Ok(())
}

/// Name-to-thunk lookup for one device.
#[derive(Debug, Default)]
pub struct SymbolTable {
    registered: Mutex<HashMap<String, SinkThunk>>,
    libraries: Vec<SinkLibrary>,
    cache: Mutex<HashMap<String, SinkThunk>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table searching `libraries` in order.
    pub fn with_libraries(libraries: Vec<SinkLibrary>) -> Self {
        Self {
            libraries,
            ..Self::default()
        }
    }

    /// Register an in-process sink function under `name`.
    ///
    /// Replaces any earlier registration with the same name.
    pub fn register(&self, name: &str, thunk: SinkThunk) -> DispatchResult<()> {
        validate_function_name(name)?;
        let previous = self
            .registered
            .lock_recover()
            .insert(name.to_string(), thunk);
        if previous.is_some() {
            tracing::debug!(function = name, "Replaced registered sink function");
        }
        Ok(())
    }

    /// Resolve `name` to an entry point.
    pub fn resolve(&self, name: &str) -> DispatchResult<SinkThunk> {
        validate_function_name(name)?;

        if let Some(thunk) = self.registered.lock_recover().get(name) {
            return Ok(*thunk);
        }
        if let Some(thunk) = self.cache.lock_recover().get(name) {
            return Ok(*thunk);
        }

        for library in &self.libraries {
            if let Some(thunk) = library.get(name) {
                tracing::debug!(function = name, library = %library.path, "Resolved sink function");
                self.cache.lock_recover().insert(name.to_string(), thunk);
                return Ok(thunk);
            }
        }

        Err(DispatchError::resolution("function", name))
    }

    /// Whether `name` resolves.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Libraries searched after in-process registrations, in order.
    pub fn libraries(&self) -> &[SinkLibrary] {
        &self.libraries
    }
}

//! Dynamic library loading for sink functions.
//!
//! Sink functions can live in shared libraries listed in the device
//! configuration. Symbols are looked up by name on demand; the library has
//! no required exports.

use crate::error::{DispatchError, DispatchResult};
use crate::sink::SinkThunk;
use libloading::Library;
use std::ffi::CString;
use std::path::Path;

/// A loaded shared library exporting sink functions.
pub struct SinkLibrary {
    /// The underlying dynamic library handle. Kept alive so resolved thunks
    /// stay valid.
    library: Library,

    /// Path to the library file.
    pub path: String,

    /// Format detected from the file extension.
    pub format: LibraryFormat,
}

impl SinkLibrary {
    /// Load a shared library.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers. Exported symbols looked up
    /// through [`SinkLibrary::get`] must follow the sink calling convention;
    /// a library that exports a same-named symbol with a different signature
    /// causes undefined behavior when invoked.
    pub fn load<P: AsRef<Path>>(path: P) -> DispatchResult<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let format = LibraryFormat::from_path(path);

        if format != LibraryFormat::Unknown && format != LibraryFormat::native() {
            tracing::warn!(path = %path_str, ?format, "Library format does not match this platform");
        }

        let library = unsafe { Library::new(path) }
            .map_err(|e| DispatchError::load_error(&path_str, e))?;

        tracing::info!(path = %path_str, ?format, "Loaded sink library");

        Ok(Self {
            library,
            path: path_str,
            format,
        })
    }

    /// Look up an exported sink function.
    ///
    /// Returns `None` when the library does not export `name` (or `name`
    /// contains a NUL byte).
    pub fn get(&self, name: &str) -> Option<SinkThunk> {
        let symbol = CString::new(name).ok()?;
        unsafe {
            self.library
                .get::<SinkThunk>(symbol.as_bytes_with_nul())
                .ok()
                .map(|s| *s)
        }
    }
}

impl std::fmt::Debug for SinkLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkLibrary")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish()
    }
}

/// Platform-specific library format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibraryFormat {
    /// Windows DLL.
    Dll,
    /// Linux/Unix shared object.
    So,
    /// macOS dynamic library.
    Dylib,
    /// Unknown format.
    Unknown,
}

impl LibraryFormat {
    /// Detect format from file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("dll") | Some("DLL") => Self::Dll,
            Some("so") => Self::So,
            Some("dylib") => Self::Dylib,
            _ => Self::Unknown,
        }
    }

    /// Format used by the current platform.
    #[cfg(target_os = "windows")]
    pub fn native() -> Self {
        Self::Dll
    }

    #[cfg(target_os = "linux")]
    pub fn native() -> Self {
        Self::So
    }

    #[cfg(target_os = "macos")]
    pub fn native() -> Self {
        Self::Dylib
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    pub fn native() -> Self {
        Self::Unknown
    }
}

//! Durable cursor storage
//!
//! The consumer reads the cursor once at start and writes it after every
//! dispatched event. Database and key-value backends implement
//! [`CursorStore`] outside this crate.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{CursorBackend, CursorConfig};
use crate::error::{ConfigError, CursorStoreError};

/// Async cursor storage trait
#[trait_variant::make(Send)]
pub trait CursorStore {
    /// Stored cursor, if any
    async fn get(&self) -> Result<Option<i64>, CursorStoreError>;

    /// Replace the stored cursor
    async fn set(&self, cursor: i64) -> Result<(), CursorStoreError>;

    /// Forget the stored cursor
    async fn clear(&self) -> Result<(), CursorStoreError>;
}

/// In-memory cursor store
///
/// Clones share the same value.
#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursor: Arc<RwLock<Option<i64>>>,
}

impl MemoryCursorStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `cursor`
    pub fn with_cursor(cursor: i64) -> Self {
        Self {
            cursor: Arc::new(RwLock::new(Some(cursor))),
        }
    }
}

impl CursorStore for MemoryCursorStore {
    async fn get(&self) -> Result<Option<i64>, CursorStoreError> {
        Ok(*self.cursor.read().await)
    }

    async fn set(&self, cursor: i64) -> Result<(), CursorStoreError> {
        *self.cursor.write().await = Some(cursor);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CursorStoreError> {
        *self.cursor.write().await = None;
        Ok(())
    }
}

/// Cursor stored as decimal text in a local file
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    /// Store the cursor at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the cursor file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CursorStore for FileCursorStore {
    async fn get(&self) -> Result<Option<i64>, CursorStoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse()
            .map(Some)
            .map_err(|_| CursorStoreError::Parse {
                content: trimmed.to_string(),
            })
    }

    async fn set(&self, cursor: i64) -> Result<(), CursorStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, cursor.to_string()).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CursorStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cursor store selected by configuration
#[derive(Debug, Clone)]
pub enum AnyCursorStore {
    /// In-memory backend
    Memory(MemoryCursorStore),
    /// Local file backend
    File(FileCursorStore),
}

impl AnyCursorStore {
    /// Build the backend named by `config`
    pub fn from_config(config: &CursorConfig) -> Result<Self, ConfigError> {
        match config.backend {
            CursorBackend::Memory => Ok(AnyCursorStore::Memory(MemoryCursorStore::new())),
            CursorBackend::File => config
                .path
                .as_ref()
                .map(|path| AnyCursorStore::File(FileCursorStore::new(path)))
                .ok_or(ConfigError::MissingCursorPath),
        }
    }
}

impl CursorStore for AnyCursorStore {
    async fn get(&self) -> Result<Option<i64>, CursorStoreError> {
        match self {
            AnyCursorStore::Memory(store) => store.get().await,
            AnyCursorStore::File(store) => store.get().await,
        }
    }

    async fn set(&self, cursor: i64) -> Result<(), CursorStoreError> {
        match self {
            AnyCursorStore::Memory(store) => store.set(cursor).await,
            AnyCursorStore::File(store) => store.set(cursor).await,
        }
    }

    async fn clear(&self) -> Result<(), CursorStoreError> {
        match self {
            AnyCursorStore::Memory(store) => store.clear().await,
            AnyCursorStore::File(store) => store.clear().await,
        }
    }
}

// Asset sources and shared asset cache
//
// Shader modules and textures are shared between models. Each cached asset
// is an `Arc<Shared<T>>`; when the last model holding it drops its Arc the
// entry leaves the cache table and the release hook destroys the GPU object.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Where the bytes of a resource come from
#[derive(Debug, Clone)]
pub enum LoadSource {
    File(PathBuf),
    Buffer(Arc<[u8]>),
}

impl LoadSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn buffer(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Buffer(bytes.into())
    }

    /// Raw bytes of the resource
    pub fn read(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            Self::File(path) => std::fs::read(path)
                .map(Cow::Owned)
                .with_context(|| format!("Failed to read {:?}", path)),
            Self::Buffer(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }

    /// Stable key for the shared cache
    pub fn cache_key(&self) -> String {
        match self {
            Self::File(path) => format!("file:{}", path.display()),
            Self::Buffer(bytes) => {
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                format!("buffer:{:016x}:{}", hasher.finish(), bytes.len())
            }
        }
    }
}

/// Load SPIR-V words from a source (handles alignment and endianness)
pub fn load_spirv(source: &LoadSource) -> Result<Vec<u32>> {
    let bytes = source.read()?;
    ash::util::read_spv(&mut std::io::Cursor::new(bytes.as_ref()))
        .with_context(|| format!("Invalid SPIR-V in {}", source.cache_key()))
}

/// Run once when the last reference to a shared asset drops
pub type ReleaseHook<T> = Box<dyn FnOnce(&T) + Send + Sync>;
type Table<T> = Mutex<HashMap<String, Weak<Shared<T>>>>;

/// A cached asset. Dereferences to the asset value.
pub struct Shared<T> {
    key: String,
    value: T,
    table: Weak<Table<T>>,
    release: Option<ReleaseHook<T>>,
}

impl<T> Shared<T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock();
            // A fresh entry may have been inserted under the same key already
            if table.get(&self.key).is_some_and(|w| w.strong_count() == 0) {
                table.remove(&self.key);
            }
        }
        if let Some(release) = self.release.take() {
            release(&self.value);
        }
    }
}

/// Key -> weakly held shared asset
pub struct SharedCache<T> {
    name: &'static str,
    table: Arc<Table<T>>,
}

impl<T> SharedCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the live asset for `key`, or create it with `create`.
    ///
    /// `create` returns the value and the hook run when the last reference
    /// drops. Creation happens under the table lock so concurrent requests
    /// for the same key never build it twice.
    pub fn get_or_create<F>(&self, key: &str, create: F) -> Result<Arc<Shared<T>>>
    where
        F: FnOnce() -> Result<(T, ReleaseHook<T>)>,
    {
        let mut table = self.table.lock();
        if let Some(existing) = table.get(key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let (value, release) = create()?;
        let shared = Arc::new(Shared {
            key: key.to_string(),
            value,
            table: Arc::downgrade(&self.table),
            release: Some(release),
        });
        table.insert(key.to_string(), Arc::downgrade(&shared));
        log::debug!("{} cache: loaded '{}'", self.name, key);
        Ok(shared)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table
            .lock()
            .get(key)
            .is_some_and(|w| w.strong_count() > 0)
    }
}

//! Chart registry
//!
//! The registry is the list of charted projects plus, per chart, the profile
//! the user last selected. It lives in a single JSON file under the ftl home
//! directory. Every mutation is a read-modify-write performed while holding an
//! exclusive advisory lock on a sibling lock file, so concurrent invocations
//! serialize; readers take a shared lock.

use crate::config;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const REGISTRY_FILE: &str = "registry.json";
const LOCK_FILE: &str = "registry.lock";
const FORMAT_VERSION: u32 = 1;

/// Stable identifier of a chart, derived from its absolute root path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChartId(String);

impl ChartId {
    pub fn for_path(root: &Path) -> Self {
        let digest = Sha256::digest(root.to_string_lossy().as_bytes());
        let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
        let stem = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chart".to_string());
        let slug: String = stem
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "chart" } else { slug };
        ChartId(format!("{slug}-{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    pub id: ChartId,
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProfileRecord {
    pub profile: String,
    pub selected_at: DateTime<Utc>,
}

/// In-memory registry contents. Pure data; persistence is [`RegistryStore`]'s job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "format_version")]
    version: u32,
    /// Charts in registration order.
    #[serde(default)]
    charts: Vec<Chart>,
    #[serde(default)]
    active: BTreeMap<ChartId, ActiveProfileRecord>,
    /// Chart most recently added; the fallback "current" chart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    home: Option<ChartId>,
}

fn format_version() -> u32 {
    FORMAT_VERSION
}

impl Registry {
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION,
            ..Default::default()
        }
    }

    /// Register the chart rooted at `path`.
    pub fn register(&mut self, path: &Path) -> Result<Chart> {
        let root = dunce::canonicalize(path).map_err(|e| Error::InvalidChart {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !root.is_dir() {
            return Err(Error::InvalidChart {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        if let Some(existing) = self.charts.iter().find(|c| c.root == root) {
            return Err(Error::DuplicateChart {
                id: existing.id.to_string(),
                path: root,
            });
        }
        let manifest = config::manifest_in(&root).ok_or_else(|| Error::InvalidChart {
            path: root.clone(),
            reason: format!("no {} found", config::MANIFEST_FILES.join(" or ")),
        })?;

        let chart = Chart {
            id: ChartId::for_path(&root),
            root,
            manifest,
            registered_at: Utc::now(),
        };
        self.home = Some(chart.id.clone());
        self.charts.push(chart.clone());
        Ok(chart)
    }

    pub fn list(&self) -> &[Chart] {
        &self.charts
    }

    pub fn get(&self, id: &ChartId) -> Option<&Chart> {
        self.charts.iter().find(|c| &c.id == id)
    }

    /// Look a chart up by id, or by a path to its root.
    pub fn resolve(&self, id_or_path: &str) -> Result<&Chart> {
        if let Some(chart) = self.charts.iter().find(|c| c.id.as_str() == id_or_path) {
            return Ok(chart);
        }
        let candidate = dunce::canonicalize(id_or_path).unwrap_or_else(|_| PathBuf::from(id_or_path));
        self.charts
            .iter()
            .find(|c| c.root == candidate)
            .ok_or_else(|| Error::UnknownChart(id_or_path.to_string()))
    }

    /// The registered chart containing `dir`, preferring the deepest root.
    pub fn containing(&self, dir: &Path) -> Option<&Chart> {
        let dir = dunce::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.charts
            .iter()
            .filter(|c| dir.starts_with(&c.root))
            .max_by_key(|c| c.root.components().count())
    }

    pub fn home(&self) -> Option<&Chart> {
        self.home.as_ref().and_then(|id| self.get(id))
    }

    /// Remove a chart and its active-profile record.
    ///
    /// A leftover record for an already-removed chart is cleaned up and
    /// treated as success, so a retried removal converges.
    pub fn remove(&mut self, id: &ChartId) -> Result<Option<Chart>> {
        let pos = self.charts.iter().position(|c| &c.id == id);
        let orphan = self.active.remove(id).is_some();
        if self.home.as_ref() == Some(id) {
            self.home = None;
        }
        match pos {
            Some(pos) => Ok(Some(self.charts.remove(pos))),
            None if orphan => Ok(None),
            None => Err(Error::UnknownChart(id.to_string())),
        }
    }

    pub fn active_profile(&self, id: &ChartId) -> Option<&ActiveProfileRecord> {
        self.active.get(id)
    }

    /// Overwrite the chart's active profile.
    pub fn set_active_profile(&mut self, id: &ChartId, profile: &str) -> Result<()> {
        if self.get(id).is_none() {
            return Err(Error::UnknownChart(id.to_string()));
        }
        self.active.insert(
            id.clone(),
            ActiveProfileRecord {
                profile: profile.to_string(),
                selected_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// Handle on the persisted registry. Passed explicitly to every command.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

/// A consistent view of the registry, held under a shared lock.
pub struct Snapshot {
    registry: Registry,
    _lock: File,
}

impl std::ops::Deref for Snapshot {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

/// An in-progress mutation, held under the exclusive lock until committed or dropped.
pub struct Transaction<'a> {
    store: &'a RegistryStore,
    registry: Registry,
    _lock: File,
}

impl Transaction<'_> {
    pub fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Persist the mutated registry, then release the lock.
    pub fn commit(self) -> Result<()> {
        self.store.persist(&self.registry)
    }
}

impl RegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn lock_file(&self) -> Result<File> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.dir.join(LOCK_FILE);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io(&path, e))
    }

    /// Take a shared lock and load the registry.
    pub fn read(&self) -> Result<Snapshot> {
        let lock = self.lock_file()?;
        lock.lock_shared().map_err(|source| Error::LockFailed {
            path: self.path(),
            source,
        })?;
        let registry = self.load()?;
        Ok(Snapshot {
            registry,
            _lock: lock,
        })
    }

    /// Take the exclusive lock and load the registry for mutation.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let lock = self.lock_file()?;
        lock.lock_exclusive().map_err(|source| Error::LockFailed {
            path: self.path(),
            source,
        })?;
        let registry = self.load()?;
        Ok(Transaction {
            store: self,
            registry,
            _lock: lock,
        })
    }

    /// Run `f` against the registry under the exclusive lock and persist the
    /// result if `f` succeeds. Nothing is written on error.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut Registry) -> Result<T>) -> Result<T> {
        let mut txn = self.begin()?;
        let value = f(txn.registry())?;
        txn.commit()?;
        Ok(value)
    }

    fn load(&self) -> Result<Registry> {
        let path = self.path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => return Err(Error::io(&path, e)),
        };
        let registry: Registry =
            serde_json::from_str(&content).map_err(|e| Error::RegistryCorrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
        if registry.version > FORMAT_VERSION {
            return Err(Error::RegistryCorrupt {
                path,
                message: format!("unsupported registry version {}", registry.version),
            });
        }
        Ok(registry)
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        let path = self.path();
        let content = serde_json::to_vec_pretty(registry).map_err(|e| Error::RegistryCorrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let temp_path = self
            .dir
            .join(format!(".{REGISTRY_FILE}.{}.tmp", std::process::id()));
        let mut temp = File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
        temp.write_all(&content)
            .and_then(|_| temp.sync_all())
            .map_err(|e| Error::io(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| Error::io(&path, e))?;
        tracing::debug!(path = %path.display(), charts = registry.charts.len(), "registry saved");
        Ok(())
    }

    pub fn register(&self, path: &Path) -> Result<Chart> {
        self.mutate(|reg| reg.register(path))
    }

    pub fn remove(&self, id_or_path: &str) -> Result<Option<Chart>> {
        self.mutate(|reg| {
            let id = match reg.resolve(id_or_path) {
                Ok(chart) => chart.id.clone(),
                Err(_) => ChartId(id_or_path.to_string()),
            };
            reg.remove(&id)
        })
    }

    pub fn set_active_profile(&self, id: &ChartId, profile: &str) -> Result<()> {
        self.mutate(|reg| reg.set_active_profile(id, profile))
    }
}

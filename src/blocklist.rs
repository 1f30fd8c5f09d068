use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
const MAX_HOST_LENGTH: usize = 253;

/// Operator maintained set of hosts the proxy refuses to forward to.
///
/// Lookups are exact string matches against the classified host. The list
/// keeps insertion order so the persisted file reads the way it was typed.
pub struct Blocklist {
    path: PathBuf,
    hosts: RwLock<HostSet>,
    /// Serialises mutations so the file and the in-memory set change together.
    writer: Mutex<()>,
}

/// On-disk layout, shared with earlier deployments of the proxy.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BlocklistFile {
    #[serde(rename = "blockedURLs", default)]
    blocked_urls: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Change {
    Applied,
    Unchanged,
}

impl Blocklist {
    /// An empty list that persists to `path` on its first mutation.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hosts: RwLock::new(HostSet::default()),
            writer: Mutex::new(()),
        }
    }

    /// Loads the list from `path`. A missing file starts an empty list.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            tracing::info!("No blocklist at {:?}, starting empty", path);
            return Ok(Self::empty(path));
        }

        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("Failed to read metadata for blocklist: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("blocklist file too large");
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to open blocklist: {:?}", path))?;

        let file: BlocklistFile = if content.trim().is_empty() {
            BlocklistFile::default()
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse blocklist: {:?}", path))?
        };

        let mut set = HostSet::default();
        let raw_count = file.blocked_urls.len();
        for host in file.blocked_urls {
            set.insert(host);
        }

        tracing::info!(
            "Loaded blocklist: {} hosts from {} entries",
            set.order.len(),
            raw_count
        );

        Ok(Self {
            path,
            hosts: RwLock::new(set),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        self.hosts.read().contains(host)
    }

    /// Adds `host` and rewrites the file. Already listed hosts are left alone.
    ///
    /// The file is written first; if that fails the list is not changed.
    pub fn block(&self, host: &str) -> Result<Change> {
        let _writer = self.writer.lock();
        let mut next = self.hosts.read().order.clone();
        if next.iter().any(|h| h == host) {
            return Ok(Change::Unchanged);
        }
        next.push(host.to_string());
        self.save(next)?;

        self.hosts.write().insert(host.to_string());
        Ok(Change::Applied)
    }

    /// Removes `host` and rewrites the file. Unknown hosts are left alone.
    ///
    /// The file is written first; if that fails the list is not changed.
    pub fn unblock(&self, host: &str) -> Result<Change> {
        let _writer = self.writer.lock();
        let mut next = self.hosts.read().order.clone();
        let before = next.len();
        next.retain(|h| h != host);
        if next.len() == before {
            return Ok(Change::Unchanged);
        }
        self.save(next)?;

        self.hosts.write().remove(host);
        Ok(Change::Applied)
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().order.len()
    }

    fn save(&self, hosts: Vec<String>) -> Result<()> {
        let file = BlocklistFile {
            blocked_urls: hosts,
        };
        let json = serde_json::to_string_pretty(&file)?;

        // Write beside the target then rename so a crash never leaves half a file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write blocklist: {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace blocklist: {:?}", self.path))?;
        Ok(())
    }
}

#[derive(Default)]
struct HostSet {
    order: Vec<String>,
    index: HashSet<String>,
}

impl HostSet {
    fn contains(&self, host: &str) -> bool {
        self.index.contains(host)
    }

    fn insert(&mut self, host: String) -> bool {
        if self.index.contains(&host) {
            return false;
        }
        self.index.insert(host.clone());
        self.order.push(host);
        true
    }

    fn remove(&mut self, host: &str) -> bool {
        if !self.index.remove(host) {
            return false;
        }
        self.order.retain(|h| h != host);
        true
    }
}

pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOST_LENGTH {
        return false;
    }
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '[' | ']'))
}

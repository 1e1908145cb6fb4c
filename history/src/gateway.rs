//! Access to the live file tree, used by revert.
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{instrument, trace};

use crate::path::{Path, PathBuf};

/// The operations revert performs on the live file tree.
///
/// Paths are relative to the root of the tracked workspace. Failures are plain
/// [io::Error]s; [io::ErrorKind::NotFound] means the live tree diverged from
/// what history expected.
#[async_trait]
pub trait FileSystemGateway: Send + Sync {
    /// Reads a file. None if there's no file at that path.
    async fn read(&self, path: &Path) -> io::Result<Option<Bytes>>;

    /// Creates or replaces a file.
    async fn write(&self, path: &Path, contents: Bytes) -> io::Result<()>;

    /// Creates a directory, succeeding if it already exists.
    async fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Deletes a file, or a directory with everything below it.
    async fn delete(&self, path: &Path) -> io::Result<()>;

    /// Renames a file or directory. The destination must not exist.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

#[async_trait]
impl<A> FileSystemGateway for A
where
    A: AsRef<dyn FileSystemGateway> + Send + Sync,
{
    async fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        self.as_ref().read(path).await
    }

    async fn write(&self, path: &Path, contents: Bytes) -> io::Result<()> {
        self.as_ref().write(path, contents).await
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.as_ref().create_dir(path).await
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        self.as_ref().delete(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.as_ref().rename(from, to).await
    }
}

/// Operates on a directory of the host file system.
#[derive(Clone, Debug)]
pub struct HostFsGateway {
    root: std::path::PathBuf,
}

impl HostFsGateway {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, path: &Path) -> std::path::PathBuf {
        path.to_owned().to_host_path(&self.root)
    }
}

#[async_trait]
impl FileSystemGateway for HostFsGateway {
    #[instrument(skip(self), err)]
    async fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        let host_path = self.host_path(path);
        match tokio::fs::metadata(&host_path).await {
            Ok(m) if m.is_dir() => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(Some(tokio::fs::read(host_path).await?.into()))
    }

    #[instrument(skip(self, contents), err, fields(contents.size = contents.len()))]
    async fn write(&self, path: &Path, contents: Bytes) -> io::Result<()> {
        tokio::fs::write(self.host_path(path), contents).await
    }

    #[instrument(skip(self), err)]
    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        let host_path = self.host_path(path);
        match tokio::fs::create_dir(&host_path).await {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if tokio::fs::metadata(&host_path).await?.is_dir() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            res => res,
        }
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, path: &Path) -> io::Result<()> {
        let host_path = self.host_path(path);
        if tokio::fs::symlink_metadata(&host_path).await?.is_dir() {
            tokio::fs::remove_dir_all(host_path).await
        } else {
            tokio::fs::remove_file(host_path).await
        }
    }

    #[instrument(skip(self), err)]
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let to = self.host_path(to);
        if tokio::fs::try_exists(&to).await? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists", to.display()),
            ));
        }
        tokio::fs::rename(self.host_path(from), to).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryNode {
    Directory,
    File(Bytes),
}

/// What [MemoryGateway] does once its fault triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a permission error.
    Fail,
    /// Never return.
    Stall,
}

/// An in-memory file tree, for tests and dry runs.
///
/// A fault can be injected to trigger after a number of successful mutating
/// calls.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    nodes: Arc<RwLock<BTreeMap<PathBuf, MemoryNode>>>,
    fault: Arc<RwLock<Option<(Fault, Arc<AtomicUsize>)>>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, and any missing parent directories.
    pub fn insert_file(&self, path: &Path, contents: impl Into<Bytes>) {
        let mut nodes = self.nodes.write();
        insert_parents(&mut nodes, path);
        nodes.insert(path.to_owned(), MemoryNode::File(contents.into()));
    }

    /// Adds a directory, and any missing parent directories.
    pub fn insert_dir(&self, path: &Path) {
        let mut nodes = self.nodes.write();
        insert_parents(&mut nodes, path);
        nodes.insert(path.to_owned(), MemoryNode::Directory);
    }

    /// Everything below the root.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, MemoryNode> {
        self.nodes.read().clone()
    }

    /// Makes every mutating call after the next `ops` ones run into `fault`.
    pub fn inject_fault_after(&self, ops: usize, fault: Fault) {
        *self.fault.write() = Some((fault, Arc::new(AtomicUsize::new(ops))));
    }

    pub fn clear_fault(&self) {
        *self.fault.write() = None;
    }

    async fn check_fault(&self, path: &Path) -> io::Result<()> {
        let fault = {
            let guard = self.fault.read();
            match guard.as_ref() {
                None => return Ok(()),
                Some((fault, remaining)) => {
                    match remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    }) {
                        Ok(_) => return Ok(()),
                        Err(_) => *fault,
                    }
                }
            }
        };

        trace!(%path, ?fault, "injected fault");
        match fault {
            Fault::Fail => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("injected failure at {}", path),
            )),
            Fault::Stall => std::future::pending().await,
        }
    }

    fn require_parent_dir(nodes: &BTreeMap<PathBuf, MemoryNode>, path: &Path) -> io::Result<()> {
        match path.parent() {
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the root can't be modified",
            )),
            Some(parent) if parent.is_root() => Ok(()),
            Some(parent) => match nodes.get(parent) {
                Some(MemoryNode::Directory) => Ok(()),
                Some(MemoryNode::File(_)) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is not a directory", parent),
                )),
                None => Err(not_found(parent)),
            },
        }
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path))
}

fn insert_parents(nodes: &mut BTreeMap<PathBuf, MemoryNode>, path: &Path) {
    let mut parent = path.parent();
    while let Some(p) = parent {
        if p.is_root() {
            break;
        }
        nodes.entry(p.to_owned()).or_insert(MemoryNode::Directory);
        parent = p.parent();
    }
}

#[async_trait]
impl FileSystemGateway for MemoryGateway {
    async fn read(&self, path: &Path) -> io::Result<Option<Bytes>> {
        Ok(match self.nodes.read().get(path) {
            Some(MemoryNode::File(contents)) => Some(contents.clone()),
            _ => None,
        })
    }

    async fn write(&self, path: &Path, contents: Bytes) -> io::Result<()> {
        self.check_fault(path).await?;

        let mut nodes = self.nodes.write();
        Self::require_parent_dir(&nodes, path)?;
        if let Some(MemoryNode::Directory) = nodes.get(path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", path),
            ));
        }
        nodes.insert(path.to_owned(), MemoryNode::File(contents));
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.check_fault(path).await?;

        let mut nodes = self.nodes.write();
        Self::require_parent_dir(&nodes, path)?;
        match nodes.get(path) {
            Some(MemoryNode::Directory) => Ok(()),
            Some(MemoryNode::File(_)) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a file", path),
            )),
            None => {
                nodes.insert(path.to_owned(), MemoryNode::Directory);
                Ok(())
            }
        }
    }

    async fn delete(&self, path: &Path) -> io::Result<()> {
        self.check_fault(path).await?;

        let mut nodes = self.nodes.write();
        if nodes.remove(path).is_none() {
            return Err(not_found(path));
        }
        nodes.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check_fault(from).await?;

        let mut nodes = self.nodes.write();
        if !nodes.contains_key(from) {
            return Err(not_found(from));
        }
        if nodes.contains_key(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists", to),
            ));
        }
        if to.starts_with(from) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("can't move {} below itself", from),
            ));
        }
        Self::require_parent_dir(&nodes, to)?;

        let moved = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect::<Vec<_>>();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let mut new = to.to_owned();
                if let Some(rest) = old.strip_prefix(from) {
                    for component in rest.components() {
                        new.push(&component);
                    }
                }
                nodes.insert(new, node);
            }
        }
        Ok(())
    }
}

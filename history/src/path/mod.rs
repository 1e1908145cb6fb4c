//! Paths inside a tracked workspace.
//!
//! Engine paths are always relative to the workspace root and platform
//! independent. They are only used at the edges (feed events, queries and
//! revert operations); the persisted log refers to entries by id.
use bstr::ByteSlice;
use std::{
    borrow::Borrow,
    fmt::{self, Debug, Display},
    mem,
    ops::Deref,
    str::FromStr,
};

use crate::Error;

mod component;
pub use component::PathComponent;

/// Represents a borrowed, validated path.
/// Components are separated by a single `/`, there are no leading or trailing
/// separators, and no `.` or `..` components. The empty path is the root.
#[derive(Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(transparent)] // SAFETY: Representation has to match [u8]
pub struct Path {
    inner: [u8],
}

#[allow(dead_code)]
impl Path {
    // SAFETY: The empty path is valid.
    pub const ROOT: &'static Path = unsafe { Path::from_bytes_unchecked(&[]) };

    /// Convert a byte slice to a path, without checking validity.
    const unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &Path {
        // SAFETY: &[u8] and &Path have the same representation.
        unsafe { mem::transmute(bytes) }
    }

    fn from_bytes(bytes: &[u8]) -> Option<&Path> {
        if !bytes.is_empty() {
            // Ensure all components are valid entry names.
            for component in bytes.split_str(b"/") {
                if component::name_problem(component).is_some() {
                    return None;
                }
            }
        }

        // SAFETY: We have verified that the path contains no empty components.
        Some(unsafe { Path::from_bytes_unchecked(bytes) })
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// Note that the parent of a bare file name is [Path::ROOT].
    /// [Path::ROOT] is the only path without a parent.
    pub fn parent(&self) -> Option<&Path> {
        // The root does not have a parent.
        if self.inner.is_empty() {
            return None;
        }

        Some(
            if let Some((parent, _file_name)) = self.inner.rsplit_once_str(b"/") {
                // SAFETY: The parent of a valid Path is a valid Path.
                unsafe { Path::from_bytes_unchecked(parent) }
            } else {
                // The parent of a bare file name is the root.
                Path::ROOT
            },
        )
    }

    /// Creates a PathBuf with `name` adjoined to self.
    pub fn try_join(&self, name: &[u8]) -> Result<PathBuf, Error> {
        let mut v = PathBuf::with_capacity(self.inner.len() + name.len() + 1);
        v.inner.extend_from_slice(&self.inner);
        v.try_push(name)?;

        Ok(v)
    }

    /// Creates a PathBuf with an already validated component adjoined to self.
    pub fn join(&self, name: &PathComponent) -> PathBuf {
        let mut v = self.to_owned();
        v.push(name);
        v
    }

    /// Provides an iterator over the components of the path,
    /// which are individual [PathComponent].
    /// In case the path is empty, an empty iterator is returned.
    pub fn components(&self) -> impl Iterator<Item = PathComponent> + '_ {
        self.components_bytes().map(|b| PathComponent {
            inner: bytes::Bytes::copy_from_slice(b),
        })
    }

    /// Produces an iterator over the components of the path, which are
    /// individual byte slices.
    /// In case the path is empty, an empty iterator is returned.
    pub fn components_bytes(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(&b"/");

        // We don't want to return an empty element, consume it if it's the only one.
        if self.inner.is_empty() {
            let _ = iter.next();
        }

        iter
    }

    /// Returns the number of components.
    pub fn depth(&self) -> usize {
        self.components_bytes().count()
    }

    /// Returns the final component of the Path, if there is one.
    pub fn file_name(&self) -> Option<PathComponent> {
        self.components().last()
    }

    /// Whether `base` is this path or one of its ancestors.
    /// Compares whole components, so `ab` does not start with `a`.
    pub fn starts_with(&self, base: &Path) -> bool {
        if base.inner.is_empty() {
            return true;
        }

        match self.inner.strip_prefix(&base.inner) {
            Some(rest) => rest.is_empty() || rest[0] == b'/',
            None => false,
        }
    }

    /// Returns the part of the path after `base`, if `base` is an ancestor (or self).
    pub fn strip_prefix(&self, base: &Path) -> Option<&Path> {
        if !self.starts_with(base) {
            return None;
        }

        let rest = &self.inner[base.inner.len()..];
        let rest = rest.strip_prefix(b"/").unwrap_or(rest);

        // SAFETY: a whole-component suffix of a valid Path is a valid Path.
        Some(unsafe { Path::from_bytes_unchecked(rest) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

/// Represents an owned [Path].
#[derive(Clone, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct PathBuf {
    inner: Vec<u8>,
}

impl Deref for PathBuf {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        // SAFETY: PathBuf always contains a valid Path.
        unsafe { Path::from_bytes_unchecked(&self.inner) }
    }
}

impl AsRef<Path> for PathBuf {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl ToOwned for Path {
    type Owned = PathBuf;

    fn to_owned(&self) -> Self::Owned {
        PathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

impl Borrow<Path> for PathBuf {
    fn borrow(&self) -> &Path {
        self
    }
}

impl From<&Path> for PathBuf {
    fn from(value: &Path) -> Self {
        value.to_owned()
    }
}

/// Parses and normalizes a path.
///
/// - Repeated separators are deduplicated.
/// - Leading and trailing separators are dropped.
/// - Occurrences of `.` are normalized away.
/// - `..` is rejected.
///
/// Matching stays case-sensitive.
impl FromStr for PathBuf {
    type Err = Error;

    fn from_str(s: &str) -> Result<PathBuf, Self::Err> {
        let mut p = PathBuf::with_capacity(s.len());

        for component in s.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    return Err(Error::InvalidRequest(format!(
                        "path {:?} contains ..",
                        s
                    )))
                }
                name => p.try_push(name.as_bytes())?,
            }
        }

        Ok(p)
    }
}

/// Validates an already normalized path, as found in persisted data.
impl TryFrom<&[u8]> for PathBuf {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Path::from_bytes(value)
            .map(ToOwned::to_owned)
            .ok_or_else(|| Error::InvalidRequest(format!("invalid path {:?}", value.as_bstr())))
    }
}

impl Debug for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for PathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl PathBuf {
    pub fn new() -> PathBuf {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> PathBuf {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Adjoins `name` to self.
    pub fn try_push(&mut self, name: &[u8]) -> Result<(), Error> {
        component::check_name(name)?;

        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }

        self.inner.extend_from_slice(name);

        Ok(())
    }

    /// Adjoins an already validated component to self.
    pub fn push(&mut self, name: &PathComponent) {
        if !self.inner.is_empty() {
            self.inner.push(b'/');
        }

        self.inner.extend_from_slice(name.as_ref());
    }

    /// Convert from a relative [&std::path::Path] to [Self].
    ///
    /// - Absolute paths are always rejected, as are these with custom prefixes.
    /// - Repeated separators are deduplicated.
    /// - Occurrences of `.` are normalized away.
    /// - A trailing slash is normalized away.
    ///
    /// A `canonicalize_dotdot` boolean controls whether `..` will get
    /// canonicalized if possible, or should return an error.
    #[cfg(unix)]
    pub fn from_host_path(
        host_path: &std::path::Path,
        canonicalize_dotdot: bool,
    ) -> Result<Self, Error> {
        let mut p = PathBuf::with_capacity(host_path.as_os_str().len());

        for component in host_path.components() {
            match component {
                std::path::Component::Prefix(_) | std::path::Component::RootDir => {
                    return Err(Error::InvalidRequest(
                        "found disallowed prefix or rootdir".to_string(),
                    ))
                }
                std::path::Component::CurDir => continue, // ignore
                std::path::Component::ParentDir => {
                    if canonicalize_dotdot {
                        // Try popping the last element from the path being constructed.
                        p = p
                            .parent()
                            .ok_or_else(|| {
                                Error::InvalidRequest("found .. going too far up".to_string())
                            })?
                            .to_owned();
                    } else {
                        return Err(Error::InvalidRequest("found disallowed ..".to_string()));
                    }
                }
                std::path::Component::Normal(s) => {
                    // append the new component to the path being constructed.
                    p.try_push(s.as_encoded_bytes())?
                }
            }
        }

        Ok(p)
    }

    /// Resolves this path below a directory on the host.
    #[cfg(unix)]
    pub fn to_host_path(&self, root: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::ffi::OsStrExt;

        let mut host_path = root.to_path_buf();
        for component in self.components_bytes() {
            host_path.push(std::ffi::OsStr::from_bytes(component));
        }
        host_path
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner
    }
}

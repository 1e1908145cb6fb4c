use bstr::ByteSlice;
use bytes::Bytes;
use std::fmt;

use crate::Error;

/// The name of a single entry inside a directory.
///
/// Never empty, never `.` or `..`, and free of `/` and NUL.
#[repr(transparent)]
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    pub(super) inner: Bytes,
}

/// Why a byte string can't name an entry, or `None` if it can.
pub(super) fn name_problem(name: &[u8]) -> Option<&'static str> {
    match name {
        b"" => Some("empty name"),
        b"." | b".." => Some("relative name"),
        _ if name.contains(&b'/') => Some("contains a slash"),
        _ if name.contains(&0) => Some("contains a NUL byte"),
        _ => None,
    }
}

pub(super) fn check_name(name: &[u8]) -> Result<(), Error> {
    match name_problem(name) {
        None => Ok(()),
        Some(problem) => Err(Error::InvalidRequest(format!(
            "invalid entry name {:?}: {}",
            name.as_bstr(),
            problem
        ))),
    }
}

impl PathComponent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for PathComponent {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

// Bytes orders and hashes like [u8], so name-keyed maps can be probed by slice.
impl std::borrow::Borrow<[u8]> for PathComponent {
    fn borrow(&self) -> &[u8] {
        &self.inner
    }
}

impl From<PathComponent> for Bytes {
    fn from(value: PathComponent) -> Self {
        value.inner
    }
}

impl TryFrom<Bytes> for PathComponent {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        check_name(&value)?;
        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for PathComponent {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_name(value)?;
        Ok(Self {
            inner: Bytes::copy_from_slice(value),
        })
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self.inner.as_bstr(), f)
    }
}

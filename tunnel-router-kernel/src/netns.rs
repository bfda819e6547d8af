use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;

use netns_rs::NetNs;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Path to a pinned network namespace that a backend lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetNsRef(PathBuf);

impl NetNsRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for NetNsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// An open handle on a network namespace. The descriptor is released when
/// the handle is dropped, on every exit path of the caller.
pub struct Namespace {
    reference: NetNsRef,
    netns: NetNs,
}

impl Namespace {
    /// Opens the namespace, returning [`Error::NotFound`] when it no longer
    /// exists.
    pub fn open(reference: &NetNsRef) -> Result<Self> {
        if !reference.path().exists() {
            return Err(Error::NotFound(format!("network namespace {reference}")));
        }
        let netns = netns_rs::get_from_path(reference.path())?;
        debug!(%reference, "opened network namespace");
        Ok(Self {
            reference: reference.clone(),
            netns,
        })
    }

    /// Runs `f` inside the namespace.
    ///
    /// Entering a namespace switches the whole calling thread, so the work
    /// happens on a scoped thread that exits afterwards instead of on one of
    /// the runtime's workers.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        thread::scope(|s| {
            let handle = s.spawn(|| {
                self.netns.enter()?;
                f()
            });
            handle.join().map_err(|_| Error::Thread)?
        })
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        trace!(reference = %self.reference, "closing network namespace");
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("reference", &self.reference)
            .finish()
    }
}

//! Token-file cancellation protocol.
//!
//! The streaming endpoints and the cancel endpoint are independent request
//! scopes; an empty file in a shared directory is the rendezvous. Creation
//! and deletion are idempotent, and every blocking point in the pipeline
//! polls [`CancelToken::is_cancelled`].

use std::path::{Path, PathBuf};

#[derive(Clone)]
pub struct CancelRegistry {
    dir: PathBuf,
}

impl CancelRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Mark a request cancelled. Safe to call for unknown or already
    /// finished requests; the stale token is removed by the cleanup guard
    /// or simply never observed.
    pub fn cancel(&self, request_id: &str) -> std::io::Result<()> {
        let path = self.token_path(request_id);
        match std::fs::File::create(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Token handle for a request. `None` ids (client sent no header)
    /// yield a token that never reports cancellation.
    pub fn token(&self, request_id: Option<&str>) -> CancelToken {
        CancelToken {
            path: request_id.map(|id| self.token_path(id)),
        }
    }

    /// Guard that unlinks the token file when the request scope exits,
    /// whether it completed, failed, or was cancelled.
    pub fn register_cleanup(&self, request_id: Option<&str>) -> CancelCleanup {
        CancelCleanup {
            path: request_id.map(|id| self.token_path(id)),
        }
    }

    fn token_path(&self, request_id: &str) -> PathBuf {
        // Request ids are client-supplied; keep only filename-safe chars.
        let safe: String = request_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(128)
            .collect();
        self.dir.join(format!("{safe}.cancel"))
    }
}

/// Cheap, cloneable predicate polled at every blocking I/O point.
#[derive(Clone, Debug)]
pub struct CancelToken {
    path: Option<PathBuf>,
}

impl CancelToken {
    /// A token that never fires. Used by buffered endpoints without a
    /// request id and by tests.
    pub fn none() -> Self {
        Self { path: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.path {
            Some(p) => p.exists(),
            None => false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

pub struct CancelCleanup {
    path: Option<PathBuf>,
}

impl Drop for CancelCleanup {
    fn drop(&mut self) {
        if let Some(p) = &self.path {
            let _ = std::fs::remove_file(p);
        }
    }
}

//! File upload to a host
//!
//! There is no atomic rename step: a failed upload leaves the remote file in
//! an indeterminate state and the caller should re-transfer on retry.

use crate::connection::ConnectionManager;
use crate::error::{HostrunError, Result};
use crate::models::{Context, TransferResult};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Copies local files to the context's host
pub struct FileTransfer {
    connections: Arc<ConnectionManager>,
}

impl FileTransfer {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Upload `local_path` to `remote_path` on `context.host`.
    ///
    /// Relative local paths resolve against the context's local directory,
    /// relative remote paths against its working directory.
    /// When the remote path is a directory (or ends in `/`) the local file
    /// name is appended.
    ///
    /// # Errors
    ///
    /// * `HostrunError::FileNotFound` - local path missing or not a file
    /// * `HostrunError::Permission` - remote path cannot be written
    /// * `HostrunError::Execution` - transport failure mid-transfer
    pub async fn put(
        &self,
        context: &Context,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<TransferResult> {
        let local_path = match &context.local_dir {
            Some(dir) if local_path.is_relative() => dir.join(local_path),
            _ => local_path.to_path_buf(),
        };
        let local_path = local_path.as_path();

        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|_| HostrunError::FileNotFound(local_path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(HostrunError::FileNotFound(local_path.to_path_buf()));
        }
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HostrunError::FileNotFound(local_path.to_path_buf()))?;

        let host = &context.host;
        let target = absolute_remote_path(context.working_dir.as_deref(), remote_path);
        info!("[{}] put: {} -> {}", host, local_path.display(), target);

        let (remote_path, bytes) = if host.is_local() {
            let target = if target.ends_with('/') || Path::new(&target).is_dir() {
                join_remote(&target, &file_name)
            } else {
                target
            };
            let bytes = tokio::fs::copy(local_path, &target)
                .await
                .map_err(|e| local_copy_error(context, &target, e))?;
            (target, bytes)
        } else {
            match self.upload(context, local_path, target, &file_name).await {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    if matches!(e, HostrunError::Execution { .. }) {
                        // The session is suspect; the next command reconnects
                        warn!("[{}] dropping connection after failed put: {}", host, e);
                        self.connections.release(host).await;
                    }
                    return Err(e);
                }
            }
        };

        debug!("[{}] transferred {} bytes to {}", host, bytes, remote_path);

        Ok(TransferResult {
            local_path: local_path.to_path_buf(),
            remote_path,
            bytes,
        })
    }

    async fn upload(
        &self,
        context: &Context,
        local_path: &Path,
        target: String,
        file_name: &str,
    ) -> Result<(String, u64)> {
        let connection = self.connections.acquire(&context.host).await?;
        let mut connection = connection.lock().await;

        let target = if target.ends_with('/') || connection.is_dir(&target).await? {
            join_remote(&target, file_name)
        } else {
            target
        };
        let bytes = connection.upload(local_path, &target).await?;
        Ok((target, bytes))
    }
}

fn local_copy_error(context: &Context, target: &str, e: io::Error) -> HostrunError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => HostrunError::Permission {
            host: context.host.to_string(),
            path: target.to_string(),
        },
        _ => HostrunError::execution(&context.host, format!("copy to {} failed: {}", target, e)),
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Resolve `remote_path` against the working directory
pub(crate) fn absolute_remote_path(working_dir: Option<&str>, remote_path: &str) -> String {
    match working_dir {
        Some(dir) if !remote_path.starts_with('/') => {
            if remote_path.is_empty() || remote_path == "." {
                format!("{}/", dir.trim_end_matches('/'))
            } else {
                join_remote(dir, remote_path)
            }
        }
        _ => remote_path.to_string(),
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Read-only monitor socket.
//
// Every connection on the Unix socket receives one JSON snapshot of the
// printer manager followed by EOF.  The socket file doubles as the
// single-instance lock: if it already exists at startup, another connector
// is running (or crashed without cleaning up) and we refuse to start.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cloudspool_core::error::{CloudSpoolError, Result};
use cloudspool_manager::PrinterManager;

pub struct Monitor {
    listener: UnixListener,
    path: PathBuf,
}

impl Monitor {
    /// Bind the socket.  Must be called from within the runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if std::fs::symlink_metadata(&path).is_ok() {
            return Err(CloudSpoolError::MonitorSocketInUse(path));
        }
        let listener = UnixListener::bind(&path)?;
        info!(socket = %path.display(), "monitor socket listening");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Answer status queries until `shutdown` fires, then remove the socket.
    pub async fn serve(self, manager: Arc<PrinterManager>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("monitor received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(e) = send_snapshot(stream, &manager).await {
                                debug!(error = %e, "monitor client went away");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept monitor connection"),
                },
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(socket = %self.path.display(), "removed monitor socket"),
            Err(e) => warn!(socket = %self.path.display(), error = %e, "failed to remove monitor socket"),
        }
    }
}

async fn send_snapshot(mut stream: UnixStream, manager: &PrinterManager) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(&manager.snapshot())?;
    body.push(b'\n');
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}

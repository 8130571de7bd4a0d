use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ActivityLogError, ActivityRecord};

/// Starts the audit trail writer.
///
/// Each record becomes one appended line. The file is opened lazily and
/// reopened after a failed write, so a sink that comes back later resumes
/// taking records.
pub fn spawn(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<ActivityRecord>,
    errors: broadcast::Sender<ActivityLogError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Audit trail writing to {}", path.display());
        let mut file: Option<File> = None;
        let mut written = 0usize;

        while let Some(record) = rx.recv().await {
            if file.is_none() {
                match open_append(&path).await {
                    Ok(opened) => file = Some(opened),
                    Err(e) => {
                        report(&errors, format!("cannot open {}: {}", path.display(), e));
                        continue;
                    }
                }
            }

            let Some(out) = file.as_mut() else { continue };
            let mut line = record.audit_line();
            line.push('\n');
            let result = match out.write_all(line.as_bytes()).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    report(&errors, format!("write to {} failed: {}", path.display(), e));
                    file = None;
                }
            }
        }

        debug!("Audit trail closed after {} line(s)", written);
    })
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

fn report(errors: &broadcast::Sender<ActivityLogError>, reason: String) {
    let error = ActivityLogError::LogSinkUnavailable(reason);
    warn!("{}", error);
    let _ = errors.send(error);
}

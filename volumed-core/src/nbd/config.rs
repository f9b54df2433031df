use crate::error::Result;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Owns a conf.d directory of one-stanza-per-export files for the NBD
/// server. The running server is never restarted; changes are picked up
/// via SIGHUP, which nbd-server applies additively.
pub struct NbdConfigWriter {
    conf_dir: PathBuf,
    pidfile: PathBuf,
}

impl NbdConfigWriter {
    pub fn new(conf_dir: PathBuf, pidfile: PathBuf) -> Self {
        Self { conf_dir, pidfile }
    }

    pub fn stanza_path(&self, export_name: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", export_name))
    }

    /// Write the stanza for an export, atomically replacing any previous
    /// content. Rewriting an identical stanza is harmless.
    pub async fn write_stanza(&self, export_name: &str, mapper_path: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.conf_dir).await?;

        let stanza = format!(
            "[{}]\nexportname = {}\nreadonly = false\nmultifile = false\ncopyonwrite = false\n",
            export_name, mapper_path
        );

        let path = self.stanza_path(export_name);
        let tmp = self.conf_dir.join(format!(".{}.conf.tmp", export_name));
        tokio::fs::write(&tmp, stanza).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(export = %export_name, path = %path.display(), "wrote export stanza");
        Ok(path)
    }

    pub async fn remove_stanza(&self, export_name: &str) -> Result<bool> {
        let path = self.stanza_path(export_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stanza_exists(&self, export_name: &str) -> bool {
        tokio::fs::try_exists(self.stanza_path(export_name))
            .await
            .unwrap_or(false)
    }

    /// Signal the running server to re-read its config. Best effort: with
    /// no pidfile the server is down and will read the config at start.
    pub async fn reload(&self) -> Result<bool> {
        let pid = match tokio::fs::read_to_string(&self.pidfile).await {
            Ok(raw) => raw.trim().to_string(),
            Err(_) => {
                debug!(pidfile = %self.pidfile.display(), "no pidfile, skipping reload");
                return Ok(false);
            }
        };
        if pid.is_empty() || pid.parse::<u32>().is_err() {
            warn!(pidfile = %self.pidfile.display(), pid = %pid, "invalid pidfile");
            return Ok(false);
        }

        let status = tokio::process::Command::new("kill")
            .args(["-HUP", &pid])
            .status()
            .await?;
        if status.success() {
            info!(pid = %pid, "reloaded nbd server config");
            Ok(true)
        } else {
            warn!(pid = %pid, "SIGHUP to nbd server failed");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn writer(dir: &Path) -> NbdConfigWriter {
        NbdConfigWriter::new(dir.join("conf.d"), dir.join("nbd-server.pid"))
    }

    #[tokio::test]
    async fn test_stanza_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        let path = writer
            .write_stanza("migration-web-disk0", "/dev/mapper/web-disk0")
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("[migration-web-disk0]\n"));
        assert!(content.contains("exportname = /dev/mapper/web-disk0\n"));
        assert!(writer.stanza_exists("migration-web-disk0").await);

        assert!(writer.remove_stanza("migration-web-disk0").await.unwrap());
        assert!(!writer.stanza_exists("migration-web-disk0").await);
        // Second removal is a clean no-op.
        assert!(!writer.remove_stanza("migration-web-disk0").await.unwrap());
    }

    #[tokio::test]
    async fn test_rewrite_replaces_stanza() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());

        writer
            .write_stanza("migration-web-disk0", "/dev/mapper/web-disk0")
            .await
            .unwrap();
        let path = writer
            .write_stanza("migration-web-disk0", "/dev/mapper/web-disk0")
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.matches("[migration-web-disk0]").count(), 1);
    }

    #[tokio::test]
    async fn test_reload_without_pidfile_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer(dir.path());
        assert!(!writer.reload().await.unwrap());
    }
}

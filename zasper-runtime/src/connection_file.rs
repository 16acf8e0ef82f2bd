//! Reading and writing the bit-exact connection-file JSON (§3 Connection
//! Info, §6 Connection files).

use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use zasper_protocol::ConnectionInfo;

use crate::Result;

/// Writes `info` to `path` as JSON with owner-only (`0600`) permissions, and
/// sets the sticky bit on the parent directory when the platform supports it
/// so other users sharing a world-writable runtime directory can't delete or
/// rename someone else's connection file out from under them.
pub async fn write(info: &ConnectionInfo, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(info)?;
    tokio::fs::write(path, json).await?;

    #[cfg(unix)]
    {
        let file = tokio::fs::File::open(path).await?;
        let mut perms = file.metadata().await?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).await?;

        if let Some(parent) = path.parent() {
            if let Ok(metadata) = tokio::fs::metadata(parent).await {
                let mut dir_perms = metadata.permissions();
                let mode = dir_perms.mode() | 0o1000;
                dir_perms.set_mode(mode);
                let _ = tokio::fs::set_permissions(parent, dir_perms).await;
            }
        }
    }

    Ok(())
}

pub async fn load(path: &Path) -> Result<ConnectionInfo> {
    let contents = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Compares `expected` (returned by the provisioner at launch) against
/// whatever is already on disk at `path`. On a mismatch the file is replaced;
/// on a match it is left untouched, avoiding the race where a fast kernel
/// reads the file before a rewrite completes (§4.1 Reconciliation).
pub async fn reconcile(expected: &ConnectionInfo, path: &Path) -> Result<()> {
    match load(path).await {
        Ok(existing) if existing.reconciliation_eq(expected) => Ok(()),
        _ => write(expected, path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zasper_protocol::Transport;

    fn sample() -> ConnectionInfo {
        ConnectionInfo {
            ip: "127.0.0.1".to_string(),
            transport: Transport::Tcp,
            shell_port: 10,
            iopub_port: 11,
            stdin_port: 12,
            control_port: 13,
            hb_port: 14,
            key: "abc".to_string(),
            signature_scheme: "hmac-sha256".to_string(),
            kernel_name: Some("python3".to_string()),
        }
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("zasper-conn-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("kernel.json");

        write(&sample(), &path).await.unwrap();
        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded, sample());

        #[cfg(unix)]
        {
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_leaves_matching_file_untouched() {
        let dir = std::env::temp_dir().join(format!("zasper-conn-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("kernel.json");

        write(&sample(), &path).await.unwrap();
        let before = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();

        reconcile(&sample(), &path).await.unwrap();
        let after = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();
        assert_eq!(before, after);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_replaces_mismatched_file() {
        let dir = std::env::temp_dir().join(format!("zasper-conn-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("kernel.json");

        write(&sample(), &path).await.unwrap();
        let mut changed = sample();
        changed.shell_port = 9999;
        reconcile(&changed, &path).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.shell_port, 9999);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}

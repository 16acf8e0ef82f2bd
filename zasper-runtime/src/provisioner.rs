//! The local-process provisioner: allocates ports, writes the connection
//! file, and spawns the kernel subprocess (§3 Connection Info, §4.2 Kernel
//! Manager `start`).
//!
//! This is the only provisioner this crate implements — remote/containerized
//! provisioners are out of scope (§1 Out of scope).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;

use data_encoding::HEXLOWER;
use uuid::Uuid;
use zasper_protocol::{ConnectionInfo, Transport};

use crate::kernelspec::KernelspecDir;
use crate::{connection, connection_file, Result, RuntimeError};

/// A launched kernel subprocess plus the connection info that was written to
/// disk for it, before any reconciliation (§4.1) has run.
pub struct LaunchedKernel {
    pub process: tokio::process::Child,
    pub connection_info: ConnectionInfo,
    pub connection_file: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

fn random_key() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    HEXLOWER.encode(&bytes)
}

/// Allocates five ephemeral ports via `peek_ports`, assembles a fresh
/// `ConnectionInfo`, writes it to `runtime_dir/kernel-<uuid>.json`, then
/// spawns the kernelspec's command against that file. Invariant: ports are
/// either all pre-assigned by the caller (`ports`) or all discovered here —
/// never a mix (§3 Connection Info).
pub async fn launch(
    kernelspec: &KernelspecDir,
    runtime_dir: &std::path::Path,
    ip: IpAddr,
    ports: Option<[u16; 5]>,
    extra_env: Option<HashMap<String, String>>,
    extra_args: &[String],
) -> Result<LaunchedKernel> {
    let [shell_port, iopub_port, stdin_port, control_port, hb_port] = match ports {
        Some(p) => p,
        None => {
            let peeked = connection::peek_ports(ip, 5).await?;
            [peeked[0], peeked[1], peeked[2], peeked[3], peeked[4]]
        }
    };

    let connection_info = ConnectionInfo {
        ip: ip.to_string(),
        transport: Transport::Tcp,
        shell_port,
        iopub_port,
        stdin_port,
        control_port,
        hb_port,
        key: random_key(),
        signature_scheme: "hmac-sha256".to_string(),
        kernel_name: Some(kernelspec.kernel_name.clone()),
    };

    tokio::fs::create_dir_all(runtime_dir).await?;
    let connection_path = runtime_dir.join(format!("kernel-{}.json", Uuid::new_v4()));
    connection_file::write(&connection_info, &connection_path).await?;

    let stdout_path = connection_path.with_extension("stdout");
    let stderr_path = connection_path.with_extension("stderr");
    let stdout = tokio::fs::File::create(&stdout_path).await?.into_std().await;
    let stderr = tokio::fs::File::create(&stderr_path).await?.into_std().await;

    let mut command = kernelspec.command(&connection_path, Stdio::from(stdout), Stdio::from(stderr))?;
    if let Some(env) = extra_env {
        command.envs(env);
    }
    command.args(extra_args);

    let process = command.spawn().map_err(|source| RuntimeError::CommandFailed {
        command: kernelspec.kernelspec.argv[0].clone(),
        source,
    })?;

    Ok(LaunchedKernel {
        process,
        connection_info,
        connection_file: connection_path,
        stdout_path,
        stderr_path,
    })
}

/// Removes the connection file and captured stdout/stderr logs for a kernel
/// that has fully exited (mirrors the teacher's reaper cleanup: logs are
/// kept when the process exited with an error, for postmortem debugging).
pub async fn cleanup(launched: &LaunchedKernel, keep_logs_on_failure: bool, succeeded: bool) {
    if let Err(e) = tokio::fs::remove_file(&launched.connection_file).await {
        log::warn!("failed to remove connection file: {}", e);
    }
    if succeeded || !keep_logs_on_failure {
        let _ = tokio::fs::remove_file(&launched.stdout_path).await;
        let _ = tokio::fs::remove_file(&launched.stderr_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zasper_protocol::{InterruptMode, JupyterKernelspec};

    fn echo_kernelspec() -> KernelspecDir {
        KernelspecDir {
            kernel_name: "echo-test".to_string(),
            path: PathBuf::from("."),
            kernelspec: JupyterKernelspec {
                argv: vec!["true".to_string()],
                display_name: "Echo".to_string(),
                language: "none".to_string(),
                metadata: None,
                interrupt_mode: InterruptMode::Signal,
                env: None,
            },
            resources: Vec::new(),
        }
    }

    #[tokio::test]
    async fn launch_writes_connection_file_and_spawns() {
        let dir = std::env::temp_dir().join(format!("zasper-prov-test-{}", Uuid::new_v4()));
        let mut launched = launch(&echo_kernelspec(), &dir, "127.0.0.1".parse().unwrap(), None, None, &[])
            .await
            .unwrap();

        assert!(tokio::fs::metadata(&launched.connection_file).await.is_ok());
        let status = launched.process.wait().await.unwrap();
        assert!(status.success());

        cleanup(&launched, false, true).await;
        assert!(tokio::fs::metadata(&launched.connection_file).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}

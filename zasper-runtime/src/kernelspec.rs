//! Kernel-spec discovery (§3 Kernel Spec, §6 Kernel spec files): search
//! `<data_dir>/kernels/<name>/kernel.json` across every directory on the
//! data path, first-found-wins on a case-insensitive kernel name, plus the
//! static assets (`kernel.js`, `kernel.css`, `logo-*`) a kernelspec
//! directory may carry alongside its `kernel.json`.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use zasper_protocol::JupyterKernelspec;

use crate::{dirs, Result, RuntimeError};

#[derive(Debug, Clone)]
pub struct KernelspecDir {
    pub kernel_name: String,
    pub path: PathBuf,
    pub kernelspec: JupyterKernelspec,
    /// Relative filenames of `kernel.js`/`kernel.css`/`logo-*` found
    /// alongside `kernel.json`, exposed as static asset URLs by the
    /// kernelspecs HTTP route.
    pub resources: Vec<String>,
}

/// True if `name` is a bare Python interpreter name (`python`, `python3`,
/// `python3.11`, ...) rather than a path, matching CPython's own
/// `sys.executable` substitution rule (§4.2 Startup step 2).
fn is_bare_python_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("python") else {
        return false;
    };
    rest.is_empty() || rest.chars().next().is_some_and(|c| c.is_ascii_digit())
        && rest.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Resolves a bare interpreter name to an absolute path by searching `PATH`,
/// mirroring "replace argv[0] with the host interpreter's absolute path"
/// (§4.2). Unlike CPython's `sys.executable` (the currently-running
/// interpreter), this server has no embedded interpreter of its own, so the
/// nearest equivalent is the first matching executable on `PATH`.
fn resolve_host_interpreter(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

impl KernelspecDir {
    /// Builds the subprocess command line for this kernelspec, substituting
    /// `{connection_file}` and `{resource_dir}` in `argv` (§3 Kernel Spec).
    pub fn command(
        &self,
        connection_path: &Path,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<tokio::process::Command> {
        let argv = &self.kernelspec.argv;
        if argv.is_empty() {
            return Err(RuntimeError::EmptyArgv {
                kernel_name: self.kernel_name.clone(),
            });
        }

        let executable = if is_bare_python_name(&argv[0]) {
            resolve_host_interpreter(&argv[0]).unwrap_or_else(|| PathBuf::from(&argv[0]))
        } else {
            PathBuf::from(&argv[0])
        };

        let mut cmd = tokio::process::Command::new(&executable);
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

        for arg in &argv[1..] {
            match arg.as_str() {
                "{connection_file}" => cmd.arg(connection_path.as_os_str()),
                "{resource_dir}" => cmd.arg(self.path.as_os_str()),
                other => cmd.arg(OsStr::new(other)),
            };
        }
        if let Some(env) = &self.kernelspec.env {
            cmd.envs(env);
        }
        Ok(cmd)
    }
}

fn resources_in(dir: &Path) -> Vec<String> {
    let mut resources = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return resources;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name == "kernel.js" || name == "kernel.css" || name.starts_with("logo-") {
            resources.push(name);
        }
    }
    resources
}

fn read_kernelspec_json_sync(path: &Path) -> Result<JupyterKernelspec> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Lists the kernel names present under `<data_dir>/kernels`, skipping the
/// directory entirely (not erroring) if it doesn't exist.
fn list_kernelspec_names_at(data_dir: &Path) -> Vec<String> {
    let kernels_dir = data_dir.join("kernels");
    let Ok(entries) = std::fs::read_dir(&kernels_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect()
}

/// Walks the full data path (§6) and returns every discovered kernelspec,
/// first-found-wins per kernel name compared case-insensitively, exactly as
/// the original search-path precedence requires.
pub fn list_kernelspecs() -> Result<Vec<KernelspecDir>> {
    let mut seen: BTreeMap<String, KernelspecDir> = BTreeMap::new();

    for data_dir in dirs::data_path()? {
        for kernel_name in list_kernelspec_names_at(&data_dir) {
            let key = kernel_name.to_lowercase();
            if seen.contains_key(&key) {
                continue;
            }
            let kernel_dir = data_dir.join("kernels").join(&kernel_name);
            let json_path = kernel_dir.join("kernel.json");
            if let Ok(kernelspec) = read_kernelspec_json_sync(&json_path) {
                seen.insert(
                    key,
                    KernelspecDir {
                        kernel_name,
                        resources: resources_in(&kernel_dir),
                        path: kernel_dir,
                        kernelspec,
                    },
                );
            }
        }
    }

    Ok(seen.into_values().collect())
}

/// Finds one kernelspec by name (case-insensitive), searching the data path
/// in precedence order.
pub fn find_kernelspec(name: &str) -> Result<KernelspecDir> {
    let key = name.to_lowercase();
    list_kernelspecs()?
        .into_iter()
        .find(|k| k.kernel_name.to_lowercase() == key)
        .ok_or_else(|| RuntimeError::KernelspecNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests")
    }

    #[test]
    fn lists_fixture_kernelspec_names() {
        let names = list_kernelspec_names_at(&fixtures_dir());
        assert!(names.contains(&"python3".to_string()));
        assert!(names.contains(&"rust".to_string()));
    }

    #[test]
    fn reads_fixture_kernelspec_json() {
        let path = fixtures_dir().join("kernels/python3/kernel.json");
        let spec = read_kernelspec_json_sync(&path).unwrap();
        assert_eq!(spec.display_name, "Python 3");
        assert_eq!(spec.language, "python");
        assert_eq!(spec.argv[0], "python3");
    }

    #[test]
    fn rust_fixture_uses_message_interrupt_mode() {
        let path = fixtures_dir().join("kernels/rust/kernel.json");
        let spec = read_kernelspec_json_sync(&path).unwrap();
        assert_eq!(spec.interrupt_mode, zasper_protocol::InterruptMode::Message);
    }

    #[test]
    fn command_substitutes_connection_file() {
        let spec = KernelspecDir {
            kernel_name: "python3".to_string(),
            path: fixtures_dir().join("kernels/python3"),
            kernelspec: read_kernelspec_json_sync(
                &fixtures_dir().join("kernels/python3/kernel.json"),
            )
            .unwrap(),
            resources: Vec::new(),
        };
        let cmd = spec
            .command(Path::new("/tmp/conn.json"), Stdio::null(), Stdio::null())
            .unwrap();
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_owned()).collect();
        assert!(args.iter().any(|a| a == "/tmp/conn.json"));
    }

    #[test]
    fn bare_python_names_are_recognized() {
        for name in ["python", "python3", "python3.11", "python2.7"] {
            assert!(is_bare_python_name(name), "{name} should match");
        }
        for name in ["ipython", "/usr/bin/python3", "pythonic", "rust"] {
            assert!(!is_bare_python_name(name), "{name} should not match");
        }
    }

    #[test]
    fn command_leaves_non_python_argv0_untouched() {
        let spec = KernelspecDir {
            kernel_name: "rust".to_string(),
            path: fixtures_dir().join("kernels/rust"),
            kernelspec: read_kernelspec_json_sync(&fixtures_dir().join("kernels/rust/kernel.json")).unwrap(),
            resources: Vec::new(),
        };
        let cmd = spec
            .command(Path::new("/tmp/conn.json"), Stdio::null(), Stdio::null())
            .unwrap();
        assert_eq!(cmd.as_std().get_program(), OsStr::new(&spec.kernelspec.argv[0]));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let spec = KernelspecDir {
            kernel_name: "broken".to_string(),
            path: fixtures_dir(),
            kernelspec: JupyterKernelspec {
                argv: vec![],
                display_name: "Broken".to_string(),
                language: "none".to_string(),
                metadata: None,
                interrupt_mode: Default::default(),
                env: None,
            },
            resources: Vec::new(),
        };
        assert!(spec
            .command(Path::new("/tmp/conn.json"), Stdio::null(), Stdio::null())
            .is_err());
    }
}

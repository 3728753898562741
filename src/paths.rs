use color_eyre::eyre::eyre;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the workspace-local state directory, created next to the
/// descriptor file.
pub const DATA_DIR_NAME: &str = ".pmo";

/// Resolved filesystem context for one supervisor invocation: the descriptor
/// location and the host-scoped state root derived from it. Constructed once
/// by the CLI and threaded through the core.
#[derive(Clone)]
pub struct Paths {
    descriptor: PathBuf,
    base_dir: PathBuf,
    host_dir: PathBuf,
}

impl Paths {
    /// Derive the state layout from the descriptor path. State lives under
    /// `<descriptor-dir>/.pmo/<hostname>` so a descriptor shared over a
    /// network filesystem never mixes PIDs across machines.
    pub fn new(descriptor: &Path) -> color_eyre::Result<Self> {
        let descriptor = if descriptor.is_absolute() {
            descriptor.to_path_buf()
        } else {
            std::env::current_dir()?.join(descriptor)
        };
        let base_dir = descriptor
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| eyre!("descriptor path has no parent directory"))?;
        let host = hostname()?;
        let host_dir = base_dir.join(DATA_DIR_NAME).join(host);
        Ok(Self {
            descriptor,
            base_dir,
            host_dir,
        })
    }

    /// Build a layout rooted at an explicit host directory.
    pub fn with_host_dir(descriptor: PathBuf, host_dir: PathBuf) -> Self {
        let base_dir = descriptor
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            descriptor,
            base_dir,
            host_dir,
        }
    }

    pub fn descriptor(&self) -> &Path {
        &self.descriptor
    }

    /// Directory containing the descriptor; relative `cwd` values and the
    /// dotenv file resolve against it.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn env_file(&self) -> PathBuf {
        self.base_dir.join(".env")
    }

    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.host_dir.join("pids")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.host_dir.join("logs")
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{name}.pid"))
    }

    pub fn time_file(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{name}.time"))
    }

    pub fn restarts_file(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{name}.restarts"))
    }

    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}-out.log"))
    }

    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}-error.log"))
    }

    /// Create the pids/ and logs/ directories. Idempotent.
    pub fn ensure_layout(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.pid_dir())?;
        std::fs::create_dir_all(self.log_dir())
    }
}

fn hostname() -> color_eyre::Result<String> {
    let name = nix::unistd::gethostname().map_err(|e| eyre!("could not read hostname: {e}"))?;
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_paths() -> Paths {
        Paths::with_host_dir(
            PathBuf::from("/tmp/pmo-test/pmo.yml"),
            PathBuf::from("/tmp/pmo-test/.pmo/devbox"),
        )
    }

    #[test]
    fn test_host_dir_under_descriptor_dir() {
        let paths = Paths::new(Path::new("/tmp/pmo-test/pmo.yml")).unwrap();
        assert!(paths.host_dir().starts_with("/tmp/pmo-test/.pmo"));
        assert_ne!(paths.host_dir(), Path::new("/tmp/pmo-test/.pmo"));
    }

    #[test]
    fn test_relative_descriptor_becomes_absolute() {
        let paths = Paths::new(Path::new("pmo.yml")).unwrap();
        assert!(paths.descriptor().is_absolute());
        assert!(paths.descriptor().ends_with("pmo.yml"));
    }

    #[test]
    fn test_pid_file_layout() {
        let paths = test_paths();
        let pid = paths.pid_file("web");
        assert!(pid.starts_with(paths.host_dir()));
        assert!(pid.ends_with("pids/web.pid"));
    }

    #[test]
    fn test_time_file_layout() {
        let paths = test_paths();
        assert!(paths.time_file("web").ends_with("pids/web.time"));
    }

    #[test]
    fn test_restarts_file_layout() {
        let paths = test_paths();
        assert!(paths.restarts_file("web").ends_with("pids/web.restarts"));
    }

    #[test]
    fn test_log_files_include_name_and_kind() {
        let paths = test_paths();
        assert!(paths.stdout_log("web").ends_with("logs/web-out.log"));
        assert!(paths.stderr_log("web").ends_with("logs/web-error.log"));
    }

    #[test]
    fn test_env_file_next_to_descriptor() {
        let paths = test_paths();
        assert_eq!(paths.env_file(), PathBuf::from("/tmp/pmo-test/.env"));
    }

    #[test]
    fn test_ensure_layout_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_host_dir(
            dir.path().join("pmo.yml"),
            dir.path().join(".pmo").join("host"),
        );
        paths.ensure_layout().unwrap();
        paths.ensure_layout().unwrap();
        assert!(paths.pid_dir().is_dir());
        assert!(paths.log_dir().is_dir());
    }
}

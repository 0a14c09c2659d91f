//! Worker process launch.
//!
//! The worker is a Python script driving the native Bluetooth stack. This
//! module stages the script on disk, prepares the host adapter, and starts
//! the interpreter with piped stdio. [`WorkerSpawner`] is the seam tests use
//! to substitute an in-process worker.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Worker script shipped with the crate.
pub const EMBEDDED_WORKER: &str = include_str!("../worker/btworker.py");

/// Where the worker script comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerArtifact {
    /// The bundled script, written to a temp file once per process.
    Embedded,
    Path(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("worker script not found: {0}")]
    Missing(PathBuf),
    #[error("failed to stage worker script: {0}")]
    Stage(String),
}

static STAGED_WORKER: OnceLock<Result<PathBuf, String>> = OnceLock::new();

/// Label reported in place of a path when the bundled script is unusable.
const EMBEDDED_LABEL: &str = "<embedded btworker.py>";

/// Resolve the artifact to a script path, staging the embedded script on first use.
pub fn prepare_worker_artifact(artifact: &WorkerArtifact) -> Result<PathBuf, ArtifactError> {
    match artifact {
        WorkerArtifact::Path(path) => {
            if path.is_file() {
                Ok(path.clone())
            } else {
                Err(ArtifactError::Missing(path.clone()))
            }
        }
        WorkerArtifact::Embedded => {
            check_embedded(EMBEDDED_WORKER)?;
            let staged = STAGED_WORKER.get_or_init(|| stage_embedded().map_err(|e| e.to_string()));
            match staged {
                Ok(path) if path.is_file() => Ok(path.clone()),
                Ok(path) => Err(ArtifactError::Missing(path.clone())),
                Err(e) => Err(ArtifactError::Stage(e.clone())),
            }
        }
    }
}

fn check_embedded(contents: &str) -> Result<(), ArtifactError> {
    if contents.trim().is_empty() {
        return Err(ArtifactError::Missing(PathBuf::from(EMBEDDED_LABEL)));
    }
    Ok(())
}

fn stage_embedded() -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("btworker-")
        .suffix(".py")
        .tempfile()?;
    file.write_all(EMBEDDED_WORKER.as_bytes())?;
    file.flush()?;
    let path = file.into_temp_path().keep().map_err(|e| e.error)?;
    tracing::debug!(path = %path.display(), "Staged embedded worker script");
    Ok(path)
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Handle on a running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Wait for exit. Returns the exit code when there is one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A spawned worker: its three streams plus the process handle.
pub struct WorkerIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub process: Box<dyn WorkerProcess>,
}

#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub script: PathBuf,
}

/// Extension point for different worker launch strategies.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerIo, SpawnError>;
}

/// Launches the worker script with a local Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonSpawner {
    pub program: String,
    pub args: Vec<String>,
    /// Run the interpreter and preparation commands through `sudo`.
    pub sudo: bool,
    /// Commands run to completion before each launch.
    pub prepare: Vec<Vec<String>>,
}

impl Default for PythonSpawner {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: Vec::new(),
            sudo: false,
            prepare: Vec::new(),
        }
    }
}

impl PythonSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_prepare_commands(mut self, commands: Vec<Vec<String>>) -> Self {
        self.prepare = commands;
        self
    }

    /// Restart the Bluetooth service and make `adapter` discoverable before launch.
    pub fn with_linux_adapter_setup(self, adapter: &str) -> Self {
        let commands = vec![
            vec!["systemctl".into(), "restart".into(), "bluetooth".into()],
            vec!["hciconfig".into(), adapter.into(), "piscan".into()],
        ];
        self.with_prepare_commands(commands)
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }

    async fn run_prepare(&self) -> Result<(), SpawnError> {
        for step in &self.prepare {
            let Some((program, args)) = step.split_first() else {
                continue;
            };
            tracing::info!(command = %step.join(" "), "Preparing host adapter");
            let status = self
                .command(program, args)
                .stdin(Stdio::null())
                .status()
                .await?;
            if !status.success() {
                return Err(SpawnError::Other(format!(
                    "`{}` exited with {status}",
                    step.join(" ")
                )));
            }
        }
        Ok(())
    }

    fn launch_args(&self, script: &Path) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-u".to_string());
        args.push(script.display().to_string());
        args
    }
}

#[async_trait]
impl WorkerSpawner for PythonSpawner {
    async fn spawn(&self, config: &WorkerSpawnConfig) -> Result<WorkerIo, SpawnError> {
        self.run_prepare().await?;

        let args = self.launch_args(&config.script);
        tracing::info!(program = %self.program, sudo = self.sudo, script = %config.script.display(), "Spawning worker subprocess");
        let mut child = self
            .command(&self.program, &args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Other("stderr not captured".to_string()))?;

        Ok(WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            process: Box::new(ChildProcess(child)),
        })
    }
}

/// [`WorkerProcess`] backed by an OS child process.
pub struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.0.try_wait(), Ok(None))
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.0.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_artifact_is_staged_once() {
        let first = prepare_worker_artifact(&WorkerArtifact::Embedded).unwrap();
        let second = prepare_worker_artifact(&WorkerArtifact::Embedded).unwrap();
        assert_eq!(first, second);
        let staged = std::fs::read_to_string(&first).unwrap();
        assert_eq!(staged, EMBEDDED_WORKER);
    }

    #[test]
    fn empty_embedded_script_is_missing() {
        let err = check_embedded("  \n").unwrap_err();
        assert!(matches!(err, ArtifactError::Missing(p) if p == Path::new(EMBEDDED_LABEL)));
        assert!(check_embedded(EMBEDDED_WORKER).is_ok());
    }

    #[test]
    fn missing_path_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.py");
        let err = prepare_worker_artifact(&WorkerArtifact::Path(missing.clone())).unwrap_err();
        assert!(matches!(err, ArtifactError::Missing(p) if p == missing));
    }

    #[test]
    fn path_artifact_is_used_as_is() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(prepare_worker_artifact(&WorkerArtifact::Path(path.clone())).unwrap(), path);
    }

    #[test]
    fn launch_args_run_script_unbuffered() {
        let spawner = PythonSpawner::new("python3").with_args(vec!["-X".into(), "dev".into()]);
        let args = spawner.launch_args(Path::new("/tmp/btworker.py"));
        assert_eq!(args, ["-X", "dev", "-u", "/tmp/btworker.py"]);
    }

    #[tokio::test]
    async fn failing_prepare_step_aborts_spawn() {
        let spawner = PythonSpawner::new("python3").with_prepare_commands(vec![vec!["false".into()]]);
        let config = WorkerSpawnConfig {
            script: PathBuf::from("/nonexistent.py"),
        };
        let err = spawner.spawn(&config).await.err().unwrap();
        assert!(matches!(err, SpawnError::Other(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let spawner = PythonSpawner::new("/definitely/not/a/python");
        let config = WorkerSpawnConfig {
            script: PathBuf::from("/nonexistent.py"),
        };
        let err = spawner.spawn(&config).await.err().unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }
}

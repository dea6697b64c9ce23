//! Child process execution with output capture and timeouts.
//!
//! Every external tool invocation (the verifier, the mutation pass, the
//! bitcode build) goes through [`CommandSpec`]. Directory and environment
//! scoping is per-child: the requested cwd and PATH / LD_LIBRARY_PATH
//! prepends are handed to the spawned process, so the parent process is
//! never mutated and there is nothing to restore on any exit path.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::core::{Error, Result, SubprocessKind};

/// Poll interval while waiting on a child with a deadline.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// A fully described child process invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    path_prepend: Vec<PathBuf>,
    ld_path_prepend: Vec<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a new spec for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            path_prepend: Vec::new(),
            ld_path_prepend: Vec::new(),
            stdout: None,
            stderr: None,
            timeout: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the child's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Prepend a directory to the child's PATH.
    pub fn prepend_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prepend.push(dir.into());
        self
    }

    /// Prepend a directory to the child's LD_LIBRARY_PATH.
    pub fn prepend_ld_library_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ld_path_prepend.push(dir.into());
        self
    }

    /// Capture the child's stdout to the given file.
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Capture the child's stderr to the given file.
    pub fn stderr_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Kill the child and fail if it runs longer than this.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command line as a display string, for logs and mark files.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Spawn the child and wait for it to finish.
    ///
    /// Nonzero exit and timeout both surface as [`Error::Subprocess`];
    /// the child is killed when the deadline passes.
    pub fn run(&self) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        if !self.path_prepend.is_empty() {
            cmd.env("PATH", prepend_env("PATH", &self.path_prepend));
        }
        if !self.ld_path_prepend.is_empty() {
            cmd.env(
                "LD_LIBRARY_PATH",
                prepend_env("LD_LIBRARY_PATH", &self.ld_path_prepend),
            );
        }

        cmd.stdout(self.capture(&self.stdout)?);
        cmd.stderr(self.capture(&self.stderr)?);
        cmd.stdin(Stdio::null());

        tracing::debug!("executing: {}", self.command_line());

        let mut child = cmd.spawn()?;

        let status = match self.timeout {
            None => child.wait()?,
            Some(deadline) => {
                let start = Instant::now();
                loop {
                    match child.try_wait()? {
                        Some(status) => break status,
                        None => {
                            if start.elapsed() > deadline {
                                let _ = child.kill();
                                let _ = child.wait();
                                return Err(Error::subprocess(
                                    self.command_line(),
                                    SubprocessKind::Timeout,
                                ));
                            }
                            std::thread::sleep(WAIT_POLL);
                        }
                    }
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::subprocess(
                self.command_line(),
                SubprocessKind::Exit(status_code(status)),
            ))
        }
    }

    fn capture(&self, path: &Option<PathBuf>) -> Result<Stdio> {
        match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Ok(Stdio::from(File::create(path)?))
            }
            None => Ok(Stdio::null()),
        }
    }
}

/// Build the value of an env var with directories prepended.
fn prepend_env(key: &str, dirs: &[PathBuf]) -> String {
    let prefix = dirs
        .iter()
        .map(|d| d.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":");
    match std::env::var(key) {
        Ok(old) if !old.is_empty() => format!("{prefix}:{old}"),
        _ => prefix,
    }
}

/// Map an exit status to the code the mark files record.
fn status_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

/// Prepend directories to the current process's PATH.
///
/// Used once at startup so every child sees the saw and llvm
/// distributions, mirroring the root entrypoint of the original driver.
pub fn prepend_process_path(dirs: &[PathBuf]) {
    std::env::set_var("PATH", prepend_env("PATH", dirs));
}

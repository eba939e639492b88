//! Spawning child processes with a declarative configuration and typed
//! errors for everything that can go wrong with one.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{FromRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

pub const SHELL: &str = "/bin/sh";

/// The ambient environment, captured once at startup. Spawned children see
/// this snapshot (plus per-spawn overrides), never the live environment, so
/// overrides compose deterministically.
static BASE_ENV: LazyLock<BTreeMap<String, String>> =
    LazyLock::new(|| std::env::vars().collect());

/// Render an argv for human eyes, quoting arguments that contain shell
/// specials.
pub fn stringify_argv<I>(argv: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    const ANY_SPECIALS: &str = " \t\n~`#$&*()\\|[];'\"<>?";
    const STRONG_SPECIALS: &str = "$`\\\"";

    let mut out = String::new();
    for (i, arg) in argv.into_iter().enumerate() {
        let arg = arg.as_ref();
        if i > 0 {
            out.push(' ');
        }
        if arg.contains(|c| ANY_SPECIALS.contains(c)) {
            out.push('"');
            for c in arg.chars() {
                if STRONG_SPECIALS.contains(c) {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// What to do with one of the three standard file descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdAction {
    Inherit,
    Close,
    Pipe,
    /// Only meaningful for stderr.
    MergeWithStdout,
}

/// The fallback action when a harness is dropped without having been waited
/// on. `Kill` maps onto kill-on-drop; the `Wait*` variants cannot block in a
/// destructor, so their contract is honoured by the explicit `wait*` calls
/// and drop merely lets the runtime reap the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnDrop {
    Wait,
    WaitSuccess,
    Kill,
}

/// How a child terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Exited(i32),
    Signaled { signal: i32, coredumped: bool },
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Exited(code) => write!(f, "exited with status {code}"),
            Status::Signaled {
                signal,
                coredumped: true,
            } => write!(f, "died of signal {signal} (core dumped)"),
            Status::Signaled { signal, .. } => write!(f, "died of signal {signal}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The command and its context travel in the error so callers can
    /// render as much as they need.
    #[error("Failed to spawn `{cmd} {}': {source}", stringify_argv(.argv))]
    FailedToSpawn {
        cmd: String,
        argv: Vec<String>,
        cwd: Option<Utf8PathBuf>,
        env: BTreeMap<String, String>,
        source: std::io::Error,
    },

    #[error("I/O error talking to `{cmd}': {source}")]
    Io {
        cmd: String,
        source: std::io::Error,
    },

    #[error("Command `{cmd} {}' (pid {pid}) died of signal {signal}", stringify_argv(.argv))]
    DiedOfSignal {
        cmd: String,
        argv: Vec<String>,
        pid: u32,
        signal: i32,
        coredumped: bool,
    },

    #[error("Command failed with status {status}: `{cmd} {}'", stringify_argv(.argv))]
    ExitedForFailure {
        cmd: String,
        argv: Vec<String>,
        pid: u32,
        status: i32,
    },
}

pub struct HarnessBuilder {
    cmd: String,
    argv: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: BTreeMap<String, String>,
    on_drop: OnDrop,
    stdin: FdAction,
    stdout: FdAction,
    stderr: FdAction,
}

impl HarnessBuilder {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn env_remove(mut self, key: &str) -> Self {
        self.env.remove(key);
        self
    }

    pub fn on_drop(mut self, action: OnDrop) -> Self {
        self.on_drop = action;
        self
    }

    pub fn stdin(mut self, action: FdAction) -> Self {
        self.stdin = action;
        self
    }

    pub fn stdout(mut self, action: FdAction) -> Self {
        self.stdout = action;
        self
    }

    pub fn stderr(mut self, action: FdAction) -> Self {
        self.stderr = action;
        self
    }

    pub fn spawn(self) -> Result<Harness, HarnessError> {
        let mut command = Command::new(&self.cmd);
        command.args(&self.argv);
        command.env_clear();
        command.envs(&self.env);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }
        command.kill_on_drop(self.on_drop == OnDrop::Kill);

        command.stdin(match self.stdin {
            FdAction::Inherit => Stdio::inherit(),
            FdAction::Close => Stdio::null(),
            _ => Stdio::piped(),
        });

        // Merged stderr needs a pipe of our own so that both fds can point
        // at the same write end.
        let mut merged_read: Option<OwnedFd> = None;
        if self.stderr == FdAction::MergeWithStdout {
            let (read_end, write_end) = cloexec_pipe().map_err(|source| {
                self.spawn_error(source)
            })?;
            let write_dup = write_end.try_clone().map_err(|source| {
                self.spawn_error(source)
            })?;
            command.stdout(Stdio::from(write_end));
            command.stderr(Stdio::from(write_dup));
            merged_read = Some(read_end);
        } else {
            command.stdout(match self.stdout {
                FdAction::Inherit => Stdio::inherit(),
                FdAction::Close => Stdio::null(),
                _ => Stdio::piped(),
            });
            command.stderr(match self.stderr {
                FdAction::Inherit => Stdio::inherit(),
                FdAction::Close => Stdio::null(),
                _ => Stdio::piped(),
            });
        }

        let mut child = command.spawn().map_err(|source| self.spawn_error(source))?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let stdout: Option<Box<dyn AsyncRead + Send + Unpin>> = match merged_read {
            Some(fd) => Some(Box::new(tokio::fs::File::from_std(std::fs::File::from(fd)))),
            None => child.stdout.take().map(|out| {
                Box::new(out) as Box<dyn AsyncRead + Send + Unpin>
            }),
        };
        let stderr: Option<Box<dyn AsyncRead + Send + Unpin>> = child
            .stderr
            .take()
            .map(|err| Box::new(err) as Box<dyn AsyncRead + Send + Unpin>);

        Ok(Harness {
            cmd: self.cmd,
            argv: self.argv,
            child,
            pid,
            stdin,
            stdout,
            stderr,
            status: None,
        })
    }

    fn spawn_error(&self, source: std::io::Error) -> HarnessError {
        HarnessError::FailedToSpawn {
            cmd: self.cmd.clone(),
            argv: self.argv.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            source,
        }
    }
}

/// A pipe with both ends close-on-exec. The child's copy is produced by
/// dup2(2) during spawn, which clears the flag on the descriptor the child
/// actually sees.
fn cloexec_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds points at two writable ints; ownership of the returned
    // descriptors is transferred to OwnedFd immediately.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// A spawned child process.
pub struct Harness {
    cmd: String,
    argv: Vec<String>,
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    status: Option<Status>,
}

impl Harness {
    /// Start configuring a command. Defaults: stdin and stdout piped,
    /// stderr inherited, wait-success semantics.
    pub fn cmd(cmd: impl Into<String>) -> HarnessBuilder {
        HarnessBuilder {
            cmd: cmd.into(),
            argv: Vec::new(),
            cwd: None,
            env: BASE_ENV.clone(),
            on_drop: OnDrop::WaitSuccess,
            stdin: FdAction::Pipe,
            stdout: FdAction::Pipe,
            stderr: FdAction::Inherit,
        }
    }

    /// Configure a shell invocation of `cmd_with_args`, a command string
    /// that may carry embedded arguments of its own, the way PKG_INFO and
    /// friends are configured, with positional arguments appended via
    /// `"$@"`.
    pub fn shell(cmd_with_args: &str) -> HarnessBuilder {
        Harness::cmd(SHELL)
            .arg("-c")
            .arg(format!("exec {cmd_with_args} \"$@\""))
            .arg(SHELL)
            .stdin(FdAction::Close)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write to the child's stdin and close it, letting the child see EOF.
    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), HarnessError> {
        let mut stdin = self.stdin.take().expect("stdin is not piped");
        stdin.write_all(data).await.map_err(|source| {
            HarnessError::Io {
                cmd: self.cmd.clone(),
                source,
            }
        })?;
        drop(stdin);
        Ok(())
    }

    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stderr.take()
    }

    /// Drain the child's stdout to a string (lossily for non-UTF-8 bytes).
    pub async fn read_stdout(&mut self) -> Result<String, HarnessError> {
        let mut out = self.stdout.take().expect("stdout is not piped");
        let mut buf = Vec::new();
        out.read_to_end(&mut buf)
            .await
            .map_err(|source| HarnessError::Io {
                cmd: self.cmd.clone(),
                source,
            })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a signal to the child.
    pub fn kill(&self, signal: i32) {
        if self.status.is_none() {
            // SAFETY: plain kill(2) on the child's pid.
            unsafe {
                libc::kill(self.pid as libc::pid_t, signal);
            }
        }
    }

    /// Block until the child terminates for any reason.
    pub async fn wait(&mut self) -> Result<Status, HarnessError> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        // Close our write end first or the child may never see EOF.
        self.stdin.take();
        let exit = self
            .child
            .wait()
            .await
            .map_err(|source| HarnessError::Io {
                cmd: self.cmd.clone(),
                source,
            })?;

        use std::os::unix::process::ExitStatusExt;
        let status = match exit.code() {
            Some(code) => Status::Exited(code),
            None => Status::Signaled {
                signal: exit.signal().unwrap_or(0),
                coredumped: exit.core_dumped(),
            },
        };
        self.status = Some(status);
        Ok(status)
    }

    /// Block until the child exits; dying of a signal is an error.
    pub async fn wait_exit(&mut self) -> Result<i32, HarnessError> {
        match self.wait().await? {
            Status::Exited(code) => Ok(code),
            Status::Signaled { signal, coredumped } => Err(HarnessError::DiedOfSignal {
                cmd: self.cmd.clone(),
                argv: self.argv.clone(),
                pid: self.pid,
                signal,
                coredumped,
            }),
        }
    }

    /// Block until the child exits with status zero; anything else is an
    /// error.
    pub async fn wait_success(&mut self) -> Result<(), HarnessError> {
        match self.wait_exit().await? {
            0 => Ok(()),
            status => Err(HarnessError::ExitedForFailure {
                cmd: self.cmd.clone(),
                argv: self.argv.clone(),
                pid: self.pid,
                status,
            }),
        }
    }
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("cmd", &self.cmd)
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_quoting() {
        assert_eq!(stringify_argv(["make", "clean"]), "make clean");
        assert_eq!(
            stringify_argv(["echo", "a b", "plain"]),
            "echo \"a b\" plain"
        );
        assert_eq!(stringify_argv(["x", "a\"b"]), "x \"a\\\"b\"");
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let mut h = Harness::cmd(SHELL)
            .args(["-c", "printf 'hello\\n'"])
            .stdin(FdAction::Close)
            .spawn()
            .unwrap();
        assert_eq!(h.read_stdout().await.unwrap(), "hello\n");
        assert_eq!(h.wait().await.unwrap(), Status::Exited(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_typed_error() {
        let mut h = Harness::cmd(SHELL)
            .args(["-c", "exit 3"])
            .stdin(FdAction::Close)
            .stdout(FdAction::Close)
            .spawn()
            .unwrap();
        assert_eq!(h.wait_exit().await.unwrap(), 3);
        // wait_success sees the memoised status and still classifies it.
        match h.wait_success().await {
            Err(HarnessError::ExitedForFailure { status: 3, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_carries_the_command() {
        match Harness::cmd("/nonexistent/definitely-not-a-binary").spawn() {
            Err(HarnessError::FailedToSpawn { cmd, .. }) => {
                assert_eq!(cmd, "/nonexistent/definitely-not-a-binary");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn merged_stderr_shows_up_in_stdout() {
        let mut h = Harness::cmd(SHELL)
            .args(["-c", "echo out; echo err >&2"])
            .stdin(FdAction::Close)
            .stderr(FdAction::MergeWithStdout)
            .spawn()
            .unwrap();
        let text = h.read_stdout().await.unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        h.wait_success().await.unwrap();
    }

    #[tokio::test]
    async fn shell_wrapper_passes_positional_args() {
        let mut h = Harness::shell("printf '%s.%s'")
            .args(["a", "b"])
            .spawn()
            .unwrap();
        assert_eq!(h.read_stdout().await.unwrap(), "a.b");
        h.wait_success().await.unwrap();
    }

    #[tokio::test]
    async fn env_overrides_reach_the_child() {
        let mut h = Harness::cmd(SHELL)
            .args(["-c", "printf '%s' \"$PKGWARD_TEST_VAR\""])
            .env("PKGWARD_TEST_VAR", "42")
            .stdin(FdAction::Close)
            .spawn()
            .unwrap();
        assert_eq!(h.read_stdout().await.unwrap(), "42");
        h.wait_success().await.unwrap();
    }

    #[tokio::test]
    async fn signal_death_is_reported() {
        let mut h = Harness::cmd(SHELL)
            .args(["-c", "kill -TERM $$; sleep 10"])
            .stdin(FdAction::Close)
            .stdout(FdAction::Close)
            .spawn()
            .unwrap();
        match h.wait_exit().await {
            Err(HarnessError::DiedOfSignal { signal, .. }) => {
                assert_eq!(signal, libc::SIGTERM);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::debug;

use crate::error::ConnError;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolbox {
    Standalone(Utf8PathBuf),
    Matlab(Utf8PathBuf),
}

impl Toolbox {
    pub fn detect(install_dir: Option<&Utf8Path>) -> Result<Self, ConnError> {
        if let Some(dir) = install_dir {
            let candidate = dir.join("conn");
            if candidate.is_file() {
                return Ok(Toolbox::Standalone(candidate));
            }
        }
        if let Some(conn) = find_in_path("conn") {
            return Ok(Toolbox::Standalone(paths::to_utf8(conn)?));
        }
        if let Some(matlab) = find_in_path("matlab") {
            return Ok(Toolbox::Matlab(paths::to_utf8(matlab)?));
        }
        Err(ConnError::MissingTool)
    }

    pub fn program(&self) -> &Utf8Path {
        match self {
            Toolbox::Standalone(path) | Toolbox::Matlab(path) => path,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Toolbox::Standalone(_) => "CONN standalone",
            Toolbox::Matlab(_) => "MATLAB",
        }
    }

    pub fn command(&self, script: &Utf8Path) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Toolbox::Standalone(_) => {
                cmd.arg("batch").arg(script);
            }
            Toolbox::Matlab(_) => {
                cmd.arg("-r").arg(matlab_run_expression(script));
            }
        }
        cmd
    }

    pub fn command_line(&self, script: &Utf8Path) -> String {
        match self {
            Toolbox::Standalone(program) => format!("{program} batch {script}"),
            Toolbox::Matlab(program) => {
                format!("{program} -r \"{}\"", matlab_run_expression(script))
            }
        }
    }
}

fn matlab_run_expression(script: &Utf8Path) -> String {
    format!("run('{script}'); quit;")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Success,
    Failed,
}

/// A stage fails on a non-zero or missing exit code, and also when the output
/// mentions `Error`/`ERROR`: CONN regularly exits 0 after logging a failure.
pub fn classify(exit_code: Option<i32>, output: &str) -> StageOutcome {
    if exit_code != Some(0) || output.contains("Error") || output.contains("ERROR") {
        StageOutcome::Failed
    } else {
        StageOutcome::Success
    }
}

#[derive(Debug, Clone)]
pub struct StageExecution {
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl StageExecution {
    pub fn outcome(&self) -> StageOutcome {
        classify(self.exit_code, &self.output)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait StageExecutor {
    fn execute(
        &self,
        script: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
        interrupt: &AtomicBool,
    ) -> Result<StageExecution, ConnError>;
}

impl<E: StageExecutor + ?Sized> StageExecutor for &E {
    fn execute(
        &self,
        script: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
        interrupt: &AtomicBool,
    ) -> Result<StageExecution, ConnError> {
        (**self).execute(script, on_line, interrupt)
    }
}

impl StageExecutor for Toolbox {
    fn execute(
        &self,
        script: &Utf8Path,
        on_line: &mut dyn FnMut(&str),
        interrupt: &AtomicBool,
    ) -> Result<StageExecution, ConnError> {
        let command_line = self.command_line(script);
        debug!("running {command_line}");
        let mut stream = LineStream::spawn(self.command(script)).map_err(|err| ConnError::Spawn {
            command: command_line.clone(),
            message: err.to_string(),
        })?;

        let mut output = String::new();
        loop {
            // MATLAB traps SIGINT, so the child may outlive the operator's Ctrl-C.
            if interrupt.load(Ordering::SeqCst) {
                stream.terminate();
                return Err(ConnError::Interrupted);
            }
            match stream.poll(POLL_INTERVAL) {
                Polled::Line(line) => {
                    on_line(&line);
                    output.push_str(&line);
                    output.push('\n');
                }
                Polled::Idle => {}
                Polled::Closed => break,
            }
        }
        let status = stream.wait().map_err(|err| ConnError::Spawn {
            command: command_line.clone(),
            message: err.to_string(),
        })?;

        Ok(StageExecution {
            command_line,
            exit_code: status.code(),
            output,
        })
    }
}

pub struct LineStream {
    child: Child,
    receiver: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl LineStream {
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn()?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, sender.clone()));
        }
        drop(sender);

        Ok(Self {
            child,
            receiver,
            readers,
        })
    }

    pub fn poll(&mut self, timeout: Duration) -> Polled {
        match self.receiver.recv_timeout(timeout) {
            Ok(line) => Polled::Line(line),
            Err(RecvTimeoutError::Timeout) => Polled::Idle,
            Err(RecvTimeoutError::Disconnected) => Polled::Closed,
        }
    }

    pub fn wait(mut self) -> io::Result<ExitStatus> {
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        self.child.wait()
    }

    /// Kills the child without waiting for its output to drain. Grandchildren
    /// holding the pipes open keep the reader threads alive; they are detached.
    pub fn terminate(mut self) {
        if let Err(err) = self.child.kill() {
            debug!("kill failed: {err}");
        }
        let _ = self.child.wait();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Polled {
    Line(String),
    Idle,
    Closed,
}

impl Iterator for LineStream {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.receiver.recv().ok()
    }
}

fn forward_lines<R: Read + Send + 'static>(source: R, sender: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

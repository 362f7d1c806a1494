use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

pub const DEFAULT_SUBPROCESS_TIMEOUT_SECS: u64 = 600;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments only; environment values may carry credentials.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// True when `window` appears as a contiguous run inside the argument list.
    pub fn has_args(&self, window: &[&str]) -> bool {
        if window.is_empty() {
            return true;
        }
        self.args
            .windows(window.len())
            .any(|candidate| candidate.iter().zip(window).all(|(a, b)| a == b))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }

    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Launches an external command and waits for it.
///
/// A command that runs but exits non-zero is `Ok` with the exit code recorded;
/// `Err` is reserved for launch failures and timeouts.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

pub fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    context: &str,
) -> Result<CommandOutput> {
    let output = runner
        .run(spec)
        .with_context(|| format!("{context}: failed launching {}", spec.program))?;
    if !output.success() {
        return Err(anyhow!("{context}: {}", output.failure_detail()));
    }
    Ok(output)
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_SUBPROCESS_TIMEOUT_SECS))
    }
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        match &spec.stdin_file {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("failed to open stdin file: {}", path.display()))?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        match &spec.stdout_file {
            Some(path) => {
                let file = File::create(path)
                    .with_context(|| format!("failed to create stdout file: {}", path.display()))?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }
        command.stderr(Stdio::piped());

        debug!(
            command = %spec.display(),
            timeout_secs = timeout.as_secs(),
            "spawning subprocess"
        );
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch {}", spec.program))?;

        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed waiting for {}", spec.program))?
            {
                break status;
            }
            if started.elapsed() >= timeout {
                warn!(
                    command = %spec.display(),
                    timeout_secs = timeout.as_secs(),
                    "subprocess timed out, killing"
                );
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "{} timed out after {}s",
                    spec.display(),
                    timeout.as_secs()
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: join_pipe_reader(stdout_reader),
            stderr: join_pipe_reader(stderr_reader),
        })
    }
}

fn spawn_pipe_reader<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_pipe_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
enum ScriptedResponse {
    Output(CommandOutput),
    LaunchError(String),
}

#[derive(Debug, Clone)]
struct ScriptedRule {
    program: String,
    args: Vec<String>,
    response: ScriptedResponse,
}

/// In-memory runner that answers from registered rules and records every call.
///
/// Rules match on program name plus a contiguous argument window; the most
/// recently registered matching rule wins. Unmatched commands succeed with
/// empty output. When a command redirects stdout to a file the scripted stdout is
/// written there.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<ScriptedRule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, program: &str, args: &[&str], exit_code: i32, stdout: &str, stderr: &str) {
        self.push_rule(
            program,
            args,
            ScriptedResponse::Output(CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
    }

    pub fn succeed(&self, program: &str, args: &[&str], stdout: &str) {
        self.on(program, args, 0, stdout, "");
    }

    pub fn fail(&self, program: &str, args: &[&str], stderr: &str) {
        self.on(program, args, 1, "", stderr);
    }

    pub fn missing(&self, program: &str) {
        self.push_rule(
            program,
            &[],
            ScriptedResponse::LaunchError(format!("{program}: command not found")),
        );
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, program: &str, args: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.program == program && call.has_args(args))
            .count()
    }

    pub fn was_called(&self, program: &str, args: &[&str]) -> bool {
        self.call_count(program, args) > 0
    }

    fn push_rule(&self, program: &str, args: &[&str], response: ScriptedResponse) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(ScriptedRule {
                program: program.to_string(),
                args: args.iter().map(|arg| arg.to_string()).collect(),
                response,
            });
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("scripted runner call log poisoned"))?
            .push(spec.clone());

        let response = {
            let rules = self
                .rules
                .lock()
                .map_err(|_| anyhow!("scripted runner rules poisoned"))?;
            rules
                .iter()
                .rev()
                .find(|rule| {
                    rule.program == spec.program && {
                        let window = rule.args.iter().map(String::as_str).collect::<Vec<_>>();
                        spec.has_args(&window)
                    }
                })
                .map(|rule| rule.response.clone())
        };

        let output = match response {
            Some(ScriptedResponse::LaunchError(message)) => return Err(anyhow!(message)),
            Some(ScriptedResponse::Output(output)) => output,
            None => CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            },
        };

        if let Some(path) = &spec.stdout_file {
            std::fs::write(path, &output.stdout)
                .with_context(|| format!("failed to write stdout file: {}", path.display()))?;
            return Ok(CommandOutput {
                stdout: String::new(),
                ..output
            });
        }
        Ok(output)
    }
}

use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;

use crate::error::KiraError;
use crate::stage::StageLog;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl ExternalCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
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

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push_str(&format!("{arg:?}"));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Runs external programs for a stage. Output goes to the stage log; the
/// return value is the exit code (`None` when killed by a signal).
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &ExternalCommand, log: &StageLog) -> Result<Option<i32>, KiraError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, command: &ExternalCommand, log: &StageLog) -> Result<Option<i32>, KiraError> {
        let program = find_in_path(&command.program)
            .ok_or_else(|| KiraError::MissingTool(command.program.clone()))?;
        log.info(format_args!("running: {}", command.display()));

        let mut cmd = Command::new(program.as_std_path());
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(log.stdio()?)
            .stderr(log.stdio()?);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .map_err(|err| KiraError::Filesystem(format!("spawn {}: {err}", command.program)))?;

        let status = match command.timeout {
            None => child
                .wait()
                .map_err(|err| KiraError::Filesystem(format!("wait {}: {err}", command.program)))?,
            Some(limit) => match wait_with_timeout(&mut child, limit)
                .map_err(|err| KiraError::Filesystem(format!("wait {}: {err}", command.program)))?
            {
                Some(status) => status,
                None => {
                    log.error(format_args!(
                        "{} killed after {}s",
                        command.program,
                        limit.as_secs()
                    ));
                    return Err(KiraError::ToolTimedOut {
                        tool: command.program.clone(),
                        seconds: limit.as_secs(),
                        log: log.path().to_path_buf(),
                    });
                }
            },
        };
        log.debug(format_args!("{} finished with {status}", command.program));
        Ok(status.code())
    }
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> std::io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let elapsed = started.elapsed();
        if elapsed >= limit {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(limit - elapsed));
    }
}

/// Runs `command` and turns anything but a zero exit into [`KiraError::ExternalTool`].
pub fn run_checked(
    tools: &dyn CommandRunner,
    command: &ExternalCommand,
    log: &StageLog,
) -> Result<i32, KiraError> {
    match tools.run(command, log)? {
        Some(0) => Ok(0),
        code => {
            log.error(format_args!(
                "{} failed with exit code {}",
                command.program,
                code.map(|code| code.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ));
            Err(KiraError::ExternalTool {
                tool: command.program.clone(),
                code,
                log: log.path().to_path_buf(),
            })
        }
    }
}

pub fn find_in_path(name: &str) -> Option<Utf8PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = Utf8PathBuf::from(name);
        return path.as_std_path().is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Utf8PathBuf::from_path_buf(candidate).ok();
        }
    }
    None
}

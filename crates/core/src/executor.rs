//! Process execution primitive
//!
//! Every interaction with the host (the container runtime CLI, registry login,
//! hostname lookups) goes through [`CommandExecutor`]. Commands are argument
//! vectors rather than shell strings, so nothing is re-split or re-quoted on
//! the way to the operating system.

use crate::errors::CommandError;
use std::process::{Command, Stdio};
use tracing::{debug, instrument};

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout followed by stderr, the way a terminal would show `2>&1`.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Render an argument vector for logs and error messages.
pub fn display_command(argv: &[String]) -> String {
    shell_words::join(argv)
}

/// Build an argument vector from string-likes.
pub fn argv<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Wrap a free-form host command line so it runs through `sh -c`.
pub fn host_shell(command: &str) -> Vec<String> {
    argv(["sh", "-c", command])
}

/// Executes commands and captures their output.
#[allow(async_fn_in_trait)]
pub trait CommandExecutor {
    /// Run the command to completion and capture its output.
    ///
    /// Only failing to start the program is an error here; a non-zero exit is
    /// reported through [`CommandOutput::code`].
    async fn output(&self, argv: &[String]) -> Result<CommandOutput, CommandError>;

    /// Run the command and return its stdout, failing on a non-zero exit.
    async fn run(&self, argv: &[String]) -> Result<String, CommandError> {
        let output = self.output(argv).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(CommandError::Failed {
                command: display_command(argv),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

impl<T: CommandExecutor> CommandExecutor for &T {
    async fn output(&self, argv: &[String]) -> Result<CommandOutput, CommandError> {
        (*self).output(argv).await
    }
}

/// Executor spawning real host processes
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    envs: Vec<(String, String)>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable on every spawned process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl CommandExecutor for ShellExecutor {
    #[instrument(skip(self), fields(command = %display_command(argv)))]
    async fn output(&self, argv: &[String]) -> Result<CommandOutput, CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Spawn {
                command: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        debug!("Executing: {}", display_command(argv));

        let program = program.clone();
        let args = args.to_vec();
        let envs = self.envs.clone();
        let command_line = display_command(argv);

        tokio::task::spawn_blocking(move || {
            let output = Command::new(&program)
                .args(&args)
                .envs(envs)
                .stdin(Stdio::null())
                .output()
                .map_err(|source| CommandError::Spawn {
                    command: command_line.clone(),
                    source,
                })?;

            let result = CommandOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            debug!("`{}` exited with {}", command_line, result.code);
            Ok(result)
        })
        .await
        .map_err(|e| CommandError::Join(e.to_string()))?
    }
}

pub mod mock {
    //! Scripted executor for testing orchestration flows
    //!
    //! Responses are keyed by a substring of the rendered command line. Each
    //! key holds a queue; the last queued response repeats forever. Commands
    //! without a matching rule succeed with empty output. Every call is
    //! recorded for verification.

    use super::{display_command, CommandExecutor, CommandOutput};
    use crate::errors::CommandError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Rule {
        pattern: String,
        responses: VecDeque<CommandOutput>,
    }

    /// Executor replaying scripted responses
    #[derive(Debug, Default)]
    pub struct ScriptedExecutor {
        rules: Mutex<Vec<Rule>>,
        history: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for commands containing `pattern`.
        pub fn respond(&self, pattern: &str, output: CommandOutput) -> &Self {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|rule| rule.pattern == pattern) {
                Some(rule) => rule.responses.push_back(output),
                None => rules.push(Rule {
                    pattern: pattern.to_string(),
                    responses: VecDeque::from([output]),
                }),
            }
            self
        }

        /// Queue a successful response.
        pub fn respond_ok(&self, pattern: &str, stdout: &str) -> &Self {
            self.respond(pattern, CommandOutput::ok(stdout))
        }

        /// Queue a failing response.
        pub fn respond_err(&self, pattern: &str, code: i32, stderr: &str) -> &Self {
            self.respond(pattern, CommandOutput::failed(code, stderr))
        }

        /// Rendered command lines in call order.
        pub fn calls(&self) -> Vec<String> {
            self.history
                .lock()
                .unwrap()
                .iter()
                .map(|argv| display_command(argv))
                .collect()
        }

        /// Raw argument vectors in call order.
        pub fn invocations(&self) -> Vec<Vec<String>> {
            self.history.lock().unwrap().clone()
        }

        /// Number of recorded calls containing `pattern`.
        pub fn count(&self, pattern: &str) -> usize {
            self.calls()
                .iter()
                .filter(|call| call.contains(pattern))
                .count()
        }

        /// Position of the first call containing `pattern`.
        pub fn position(&self, pattern: &str) -> Option<usize> {
            self.calls().iter().position(|call| call.contains(pattern))
        }
    }

    impl CommandExecutor for ScriptedExecutor {
        async fn output(&self, argv: &[String]) -> Result<CommandOutput, CommandError> {
            let line = display_command(argv);
            self.history.lock().unwrap().push(argv.to_vec());

            let mut rules = self.rules.lock().unwrap();
            let response = rules
                .iter_mut()
                .find(|rule| line.contains(&rule.pattern))
                .map(|rule| {
                    if rule.responses.len() > 1 {
                        rule.responses.pop_front().unwrap_or_default()
                    } else {
                        rule.responses.front().cloned().unwrap_or_default()
                    }
                });
            Ok(response.unwrap_or_default())
        }
    }
}

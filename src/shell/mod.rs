//! Fallback command interpreter.
//!
//! A restricted shell used when no sandbox runtime could be negotiated:
//! single-level pipelines over a fixed builtin set, quote-aware tokenizing,
//! no general POSIX grammar. Unknown commands can still be served through
//! the sandbox when a configured package alias matches and a runtime is
//! available.

pub mod builtins;

use std::sync::Arc;

use tracing::debug;

use crate::config::ShellConfig;
use crate::sandbox::installer::PackageInstaller;
use crate::sandbox::{ExecOutput, SandboxRuntime};

/// Outcome of one pipeline stage (and, composed, of a whole command line).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl StageResult {
    pub fn ok(stdout: String) -> Self {
        Self {
            stdout,
            ..Self::default()
        }
    }

    pub fn fail(stderr: String) -> Self {
        Self {
            stderr,
            exit_code: 1,
            ..Self::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }
}

/// Sandbox access for alias resolution, when a runtime was negotiated.
pub type SandboxAccess<'a> = (&'a Arc<dyn SandboxRuntime>, &'a PackageInstaller);

pub struct Interpreter {
    config: ShellConfig,
}

impl Interpreter {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// True if `name` resolves to something this interpreter can run: a
    /// builtin, or a configured package alias (which needs a sandbox).
    pub fn resolves(&self, name: &str) -> bool {
        builtins::is_builtin(name) || self.config.package_aliases.contains_key(name)
    }

    /// Runs one command line to completion.
    pub async fn run(&self, cmd: &str, sandbox: Option<SandboxAccess<'_>>) -> StageResult {
        let stages = split_pipeline(cmd);
        if stages.is_empty() {
            return StageResult::exit(0);
        }

        let last = stages.len() - 1;
        let mut piped = String::new();
        for (index, stage) in stages.iter().enumerate() {
            let argv = tokenize(stage);
            if argv.is_empty() {
                return StageResult::fail("syntax error: empty pipeline stage\n".to_string());
            }

            let mut result = self.run_stage(&argv, &piped, sandbox).await;
            if index < last {
                if result.exit_code != 0 {
                    // Abort the pipeline with this stage's outcome.
                    return result;
                }
                piped = std::mem::take(&mut result.stdout);
            } else {
                // A final stage that consumed input but produced nothing
                // passes the piped text through (e.g. `... | true`).
                if result.stdout.is_empty() && result.exit_code == 0 && !piped.is_empty() {
                    result.stdout = piped;
                }
                return result;
            }
        }
        unreachable!("pipeline loop returns on the final stage")
    }

    async fn run_stage(
        &self,
        argv: &[String],
        stdin: &str,
        sandbox: Option<SandboxAccess<'_>>,
    ) -> StageResult {
        let name = argv[0].as_str();
        let args = &argv[1..];

        if builtins::is_builtin(name) {
            return builtins::run_builtin(name, args, stdin, &self.config).await;
        }

        if let Some(package) = self.config.package_aliases.get(name) {
            if let Some((runtime, installer)) = sandbox {
                debug!("resolving {name} via package alias {package}");
                return run_aliased(runtime, installer, package, args).await;
            }
        }

        StageResult {
            stdout: String::new(),
            stderr: format!(
                "{name}: command not found (type 'which {name}' to see available builtins)\n"
            ),
            exit_code: 127,
        }
    }
}

/// Installs the aliased package and runs it buffered, collecting everything
/// into a stage result.
async fn run_aliased(
    runtime: &Arc<dyn SandboxRuntime>,
    installer: &PackageInstaller,
    package: &str,
    args: &[String],
) -> StageResult {
    let artifact = match installer.install(runtime, package).await {
        Ok((artifact, _)) => artifact,
        Err(e) => return StageResult::fail(format!("{package}: {e}\n")),
    };
    let handle = match runtime.spawn_package(&artifact, args).await {
        Ok(handle) => handle,
        Err(e) => return StageResult::fail(format!("{package}: {e}\n")),
    };
    collect(handle.output).await
}

/// Drains an execution's output into a single stage result.
async fn collect(output: ExecOutput) -> StageResult {
    match output {
        ExecOutput::Streamed {
            mut stdout,
            mut stderr,
            exit,
        } => {
            let mut out = Vec::new();
            let mut err = Vec::new();
            while let Some(chunk) = stdout.recv().await {
                out.extend_from_slice(&chunk);
            }
            while let Some(chunk) = stderr.recv().await {
                err.extend_from_slice(&chunk);
            }
            StageResult {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: exit.await.unwrap_or(1),
            }
        }
        ExecOutput::Buffered(done) => match done.await {
            Ok(result) => StageResult {
                stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                exit_code: result.exit_code,
            },
            Err(_) => StageResult::fail("execution ended without a result\n".to_string()),
        },
    }
}

/// Splits a command line on top-level `|`, honoring quotes and backslash.
/// Returns no stages for a blank line.
pub fn split_pipeline(cmd: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut chars = cmd.chars();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '|' if !in_single && !in_double => {
                stages.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    stages.push(current);

    if stages.len() == 1 && stages[0].trim().is_empty() {
        return Vec::new();
    }
    stages
}

/// Splits one stage into words: whitespace-separated, with single quotes
/// (literal), double quotes (backslash escapes `"` and `\`), and bare
/// backslash escaping the next character.
pub fn tokenize(stage: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = stage.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '"' => {
                in_word = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => match chars.peek() {
                            Some('"') | Some('\\') => {
                                current.push(chars.next().unwrap_or('\\'));
                            }
                            _ => current.push('\\'),
                        },
                        _ => current.push(inner),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

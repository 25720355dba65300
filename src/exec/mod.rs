use std::io::Write;
use std::process::{self, Stdio};

use log::debug;

use crate::error::{RulevarkError, RulevarkResult};
use crate::wrap;

/// Captured outcome of a finished helper process.
pub struct CommandResult {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A single invocation of a helper program.  Commands are one-shot: create
/// one via a [`CommandFactory`], optionally give it stdin, then call `run()`
/// or `output()` exactly once.
pub trait Command {
    /// Feed the given input to the process on stdin when it runs.
    fn set_stdin(&mut self, input: String);

    /// Spawn the process, write any stdin, and wait for it to exit.  A
    /// non-zero exit is not an error here, callers inspect `success`.
    fn run(&mut self) -> RulevarkResult<CommandResult>;

    /// Convenience wrapper around `run()` that treats a non-zero exit as an
    /// error and returns stdout.
    fn output(&mut self) -> RulevarkResult<Vec<u8>>;
}

/// Strategy for creating [`Command`]s, lets tests shim out the real
/// subprocesses.
pub trait CommandFactory {
    fn make_command(&self, program: &str, args: &[&str]) -> Box<dyn Command>;
}

/// The real thing: spawns helper processes via std::process.
pub struct ExecCommandFactory;

impl CommandFactory for ExecCommandFactory {
    fn make_command(&self, program: &str, args: &[&str]) -> Box<dyn Command> {
        Box::new(ExecCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: None,
        })
    }
}

struct ExecCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl Command for ExecCommand {
    fn set_stdin(&mut self, input: String) {
        self.stdin = Some(input);
    }

    fn run(&mut self) -> RulevarkResult<CommandResult> {
        debug!("running {} {:?}", self.program, self.args);

        let mut cmd = process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = wrap!(cmd.spawn(), format!("spawn {}", self.program))?;

        if let Some(input) = self.stdin.take() {
            // The handle must be dropped before waiting or the child blocks
            // on a stdin that never closes.
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| RulevarkError::msg(format!("no stdin pipe for {}", self.program)))?;
            wrap!(
                handle.write_all(input.as_bytes()),
                format!("write stdin of {}", self.program)
            )?;
        }

        let output = wrap!(
            child.wait_with_output(),
            format!("wait for {}", self.program)
        )?;
        Ok(CommandResult {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn output(&mut self) -> RulevarkResult<Vec<u8>> {
        let result = self.run()?;
        if !result.success {
            return Err(RulevarkError::Command {
                program: self.program.clone(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_captures_stdout() {
        let factory = ExecCommandFactory;
        let mut cmd = factory.make_command("echo", &["hello"]);
        let out = cmd.output().unwrap();
        assert_eq!(String::from_utf8_lossy(&out), "hello\n");
    }

    #[test]
    fn test_run_feeds_stdin() {
        let factory = ExecCommandFactory;
        let mut cmd = factory.make_command("cat", &[]);
        cmd.set_stdin("line one\nline two\n".to_string());
        let result = cmd.run().unwrap();
        assert!(result.success);
        assert_eq!(String::from_utf8_lossy(&result.stdout), "line one\nline two\n");
    }

    #[test]
    fn test_nonzero_exit_is_not_a_run_error() {
        let factory = ExecCommandFactory;
        let mut cmd = factory.make_command("sh", &["-c", "echo oops >&2; exit 3"]);
        let result = cmd.run().unwrap();
        assert!(!result.success);
        assert_eq!(String::from_utf8_lossy(&result.stderr), "oops\n");
    }

    #[test]
    fn test_nonzero_exit_fails_output() {
        let factory = ExecCommandFactory;
        let mut cmd = factory.make_command("sh", &["-c", "exit 1"]);
        match cmd.output() {
            Err(RulevarkError::Command { program, .. }) => assert_eq!(program, "sh"),
            other => panic!("expected command error, got {:?}", other.map(|_| ())),
        }
    }
}

//! Hands messages to the real mail delivery program.

use std::io::{self, Write};
use std::process::{Command, ExitStatus, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no mail command configured")]
    EmptyCommand,
    #[error("mail command {command} could not be started ({source})")]
    Spawn { command: String, source: io::Error },
    #[error("mail command {command} exited {code}{}", stderr_suffix(.stderr))]
    Exited {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("mail command {command} did not exit ({status}){}", stderr_suffix(.stderr))]
    Killed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("mail command {command} error: \"{stderr}\"")]
    Stderr { command: String, stderr: String },
    #[error("failed feeding message to {command} ({source})")]
    Feed { command: String, source: io::Error },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(", err: \"{stderr}\"")
    }
}

impl DeliveryError {
    /// Exit status to report upstream: the program's own code when it
    /// exited non-zero, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeliveryError::Exited { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

/// Delivers a message by running a command with the message on stdin.
pub trait Deliver {
    fn deliver(&self, argv: &[String], message: &[u8]) -> Result<(), DeliveryError>;
}

/// Runs the configured program directly, without a shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgramDelivery;

impl Deliver for ProgramDelivery {
    fn deliver(&self, argv: &[String], message: &[u8]) -> Result<(), DeliveryError> {
        let (program, args) = argv.split_first().ok_or(DeliveryError::EmptyCommand)?;
        let command = argv.join(" ");
        log::trace!("Mail command is \"{command}\".");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DeliveryError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Dropping stdin closes the pipe so the program sees end of input.
        let fed = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(message).and_then(|()| stdin.flush()),
            None => Ok(()),
        };

        let output = child.wait_with_output().map_err(|source| DeliveryError::Feed {
            command: command.clone(),
            source,
        })?;
        log::trace!("r == {}", output.status);

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if !output.status.success() {
            return Err(match output.status.code() {
                Some(code) => DeliveryError::Exited {
                    command,
                    code,
                    stderr,
                },
                None => DeliveryError::Killed {
                    command,
                    status: output.status,
                    stderr,
                },
            });
        }
        if let Err(source) = fed {
            return Err(DeliveryError::Feed { command, source });
        }
        if !stderr.is_empty() {
            return Err(DeliveryError::Stderr { command, stderr });
        }
        if !stdout.is_empty() {
            log::warn!("Warning:  command \"{command}\" said \"{stdout}\"");
        }

        log::trace!("Sent mail.");
        Ok(())
    }
}

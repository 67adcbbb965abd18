use anyhow::Result;

use crate::{
    errors::HarnessError,
    models::{Invocation, Outcome},
};

pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<Outcome>;

    /// Runs the invocation and turns a non-zero exit, a kill or a timeout into an error.
    fn run_checked(&mut self, invocation: &Invocation) -> Result<Outcome> {
        let outcome = self.run(invocation)?;

        if outcome.timed_out {
            let seconds = invocation.timeout.map(|t| t.as_secs()).unwrap_or(0);
            return Err(HarnessError::CommandTimedOut {
                command: invocation.command_line(),
                seconds,
            }
            .into());
        }

        match outcome.code {
            Some(0) => Ok(outcome),
            Some(code) => Err(HarnessError::CommandFailed {
                command: invocation.command_line(),
                code,
            }
            .into()),
            None => Err(HarnessError::CommandKilled {
                command: invocation.command_line(),
            }
            .into()),
        }
    }
}

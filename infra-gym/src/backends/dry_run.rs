use anyhow::Result;

use crate::{
    console::Console,
    models::{Invocation, Outcome},
    services::CommandRunner,
};

/// Prints what would have run instead of running it.
pub struct DryRunRunner {
    console: Console,
}

impl DryRunRunner {
    pub fn new(console: Console) -> DryRunRunner {
        DryRunRunner { console }
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<Outcome> {
        self.console.dry_run(invocation.command_line())?;

        Ok(Outcome::ok())
    }
}

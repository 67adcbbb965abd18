use anyhow::Result;
use crossterm::{
    style::{self, Colorize, StyledContent, Styler},
    QueueableCommand,
};
use std::{
    fmt::Display,
    io::{stdout, Write},
};

/// Operator-facing output with colored level prefixes.
///
/// Diagnostics go through `log`; the console only carries what the operator is meant to
/// read: progress, warnings and the fatal error that ends a run.
pub struct Console {
    out: Box<dyn Write>,
}

impl Console {
    pub fn stdout() -> Console {
        Console::new(stdout())
    }

    pub fn new<W: 'static + Write>(out: W) -> Console {
        Console { out: Box::new(out) }
    }

    pub fn info<D: Display>(&mut self, message: D) -> Result<()> {
        self.prefixed("[INFO] ".cyan().bold(), message)
    }

    pub fn success<D: Display>(&mut self, message: D) -> Result<()> {
        self.prefixed("[ OK ] ".green().bold(), message)
    }

    pub fn warn<D: Display>(&mut self, message: D) -> Result<()> {
        self.prefixed("[WARN] ".yellow().bold(), message)
    }

    pub fn error<D: Display>(&mut self, message: D) -> Result<()> {
        self.prefixed("[ERROR] ".red().bold(), message)
    }

    pub fn dry_run<D: Display>(&mut self, message: D) -> Result<()> {
        self.prefixed("[DRY-RUN] ".magenta().bold(), message)
    }

    /// Unprefixed output, used for tables and reports.
    pub fn writer(&mut self) -> &mut dyn Write {
        &mut self.out
    }

    fn prefixed<D: Display>(
        &mut self,
        prefix: StyledContent<&'static str>,
        message: D,
    ) -> Result<()> {
        self.out
            .queue(style::PrintStyledContent(prefix))?
            .queue(style::Print(format!("{}\n", message)))?
            .flush()?;

        Ok(())
    }
}

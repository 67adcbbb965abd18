use anyhow::Result;
use std::{
    cell::RefCell,
    io::{self, Write},
    rc::Rc,
};

use crate::{
    models::{Invocation, Outcome},
    services::CommandRunner,
};

/// A cloneable in-memory writer, so a test can read back what a `Console` printed.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct CallLog(Rc<RefCell<Vec<Invocation>>>);

impl CallLog {
    pub fn invocations(&self) -> Vec<Invocation> {
        self.0.borrow().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    /// Program followed by its arguments, one vector per invocation.
    pub fn argv(&self) -> Vec<Vec<String>> {
        self.0
            .borrow()
            .iter()
            .map(|invocation| {
                std::iter::once(invocation.program.clone())
                    .chain(invocation.args.iter().cloned())
                    .collect()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn any(&self, needle: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(needle))
    }
}

/// Records every invocation and answers with whatever the handler returns.
pub struct ScriptedRunner {
    log: CallLog,
    handler: Box<dyn FnMut(&Invocation) -> Outcome>,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> (ScriptedRunner, CallLog)
    where
        F: 'static + FnMut(&Invocation) -> Outcome,
    {
        let log = CallLog::default();
        let runner = ScriptedRunner {
            log: log.clone(),
            handler: Box::new(handler),
        };

        (runner, log)
    }

    pub fn succeeding() -> (ScriptedRunner, CallLog) {
        ScriptedRunner::new(|_| Outcome::ok())
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<Outcome> {
        self.log.0.borrow_mut().push(invocation.clone());
        Ok((self.handler)(invocation))
    }
}

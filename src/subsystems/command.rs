//! Static per-subsystem command tables.
//!
//! A table is a dense slice indexed by the command id byte. An empty slot
//! marks an id inside the range that has no handler.

use crate::error::{Error, Result};
use crate::frame::Frame;
use serde::Serialize;
use tracing::trace;

pub type CommandHandler<S> = fn(&S, &mut Frame, &mut Frame, u32) -> Result<()>;

pub struct CommandSpec<S: ?Sized> {
    pub name: &'static str,
    pub description: &'static str,
    /// Field layout of the request payload, for ground tooling.
    pub input: &'static str,
    /// Field layout of the response payload.
    pub output: &'static str,
    pub handler: CommandHandler<S>,
}

impl<S: ?Sized> CommandSpec<S> {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        input: &'static str,
        output: &'static str,
        handler: CommandHandler<S>,
    ) -> Self {
        Self {
            name,
            description,
            input,
            output,
            handler,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDescriptor {
    pub id: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub input: &'static str,
    pub output: &'static str,
}

pub struct CommandTable<S: 'static> {
    slots: &'static [Option<CommandSpec<S>>],
}

impl<S> CommandTable<S> {
    pub const fn new(slots: &'static [Option<CommandSpec<S>>]) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reads the command id from `iframe` and runs its handler with the
    /// rest of the frame. The handler's result is returned as-is.
    pub fn execute(&self, ss: &S, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        let id = iframe.get_u8().map_err(|_| Error::Illegal)?;
        match self.slots.get(id as usize) {
            Some(Some(spec)) => (spec.handler)(ss, iframe, oframe, sequence),
            Some(None) => {
                trace!("command {} has no handler", id);
                Err(Error::Illegal)
            }
            None => {
                trace!("command {} out of range ({} entries)", id, self.slots.len());
                Err(Error::Illegal)
            }
        }
    }

    pub fn describe(&self) -> Vec<CommandDescriptor> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                slot.as_ref().map(|spec| CommandDescriptor {
                    id: id as u8,
                    name: spec.name,
                    description: spec.description,
                    input: spec.input,
                    output: spec.output,
                })
            })
            .collect()
    }
}

pub struct SelfTest<S: ?Sized> {
    pub name: &'static str,
    pub run: fn(&S) -> Result<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfTestReport {
    pub name: &'static str,
    pub result: Result<()>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct SelfTestTable<S: 'static> {
    tests: &'static [SelfTest<S>],
}

impl<S> SelfTestTable<S> {
    pub const fn new(tests: &'static [SelfTest<S>]) -> Self {
        Self { tests }
    }

    pub fn run_all(&self, ss: &S) -> Vec<SelfTestReport> {
        self.tests
            .iter()
            .map(|test| SelfTestReport {
                name: test.name,
                result: (test.run)(ss),
            })
            .collect()
    }
}

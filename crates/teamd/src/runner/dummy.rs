//! Runner that selects no kernel mode and does nothing.

use super::Runner;

#[derive(Debug, Default)]
pub struct DummyRunner;

impl Runner for DummyRunner {}

pub(super) fn create() -> Box<dyn Runner> {
    Box::new(DummyRunner)
}

use crate::{EventCollector, EventError};

/// Identifies an open collector within a [`CollectorStack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectorId(usize);

/// A stack of collectors scoping event accounting.
///
/// The root collector holds process-wide totals. Opening a sub-collector
/// pushes; closing it merges its contents into the collector below.
/// Only the top of the stack may be closed, and never the root.
#[derive(Debug)]
pub struct CollectorStack {
    stack: Vec<EventCollector>,
}

impl Default for CollectorStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorStack {
    pub fn new() -> Self {
        Self {
            stack: vec![EventCollector::new()],
        }
    }

    /// The currently active collector (top of the stack).
    pub fn current(&mut self) -> &mut EventCollector {
        // the root entry is never popped
        self.stack.last_mut().unwrap()
    }

    /// The process-wide totals.
    pub fn root(&self) -> &EventCollector {
        &self.stack[0]
    }

    pub fn open(&mut self) -> CollectorId {
        self.stack.push(EventCollector::new());
        CollectorId(self.stack.len() - 1)
    }

    /// Merge the collector up into its parent and pop it. Fails without
    /// touching any state when `id` is not the top of the stack.
    pub fn close(&mut self, id: CollectorId) -> Result<(), EventError> {
        if id.0 == 0 {
            return Err(EventError::Root);
        }
        if id.0 != self.stack.len() - 1 {
            return Err(EventError::NotTopOfStack);
        }
        let closed = self.stack.pop().unwrap();
        self.current().merge(&closed);
        Ok(())
    }
}

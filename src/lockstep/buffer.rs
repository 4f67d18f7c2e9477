//! Commands waiting for the next cycle boundary

use super::Command;

#[derive(Debug, Default)]
pub struct CommandBuffer {
    pending: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.pending.push(command);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    /// Swap the buffer for an empty one and return everything it held
    pub fn take_batch(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending)
    }
}

use crate::config::QueueMode;
use crate::protocol::Command;
use std::collections::VecDeque;

/// FIFO of commands waiting to be written to the control socket
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
    mode: QueueMode,
}

impl CommandQueue {
    pub fn new(mode: QueueMode) -> Self {
        Self {
            pending: VecDeque::new(),
            mode,
        }
    }

    pub fn enqueue(&mut self, command: Command) {
        if command.has_credentials() {
            tracing::trace!("Queued: {}", command);
        } else {
            tracing::debug!("Queued: {}", command);
        }
        self.pending.push_back(command);
    }

    /// Commands to write in this dispatch, removed from the front
    pub fn take_batch(&mut self) -> Vec<Command> {
        let n = match self.mode {
            QueueMode::OnePerTick => 1,
            QueueMode::Drain => self.pending.len(),
        };
        let n = n.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

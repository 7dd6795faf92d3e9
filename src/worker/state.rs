use crate::models::{ExecutionState, Message};
use crate::transport::WorkerChannel;

/// Execution state that announces itself. Every setter sends one
/// `updateExecutionState` when, and only when, the value actually changes.
#[derive(Debug)]
pub(crate) struct StateBroadcaster {
    state: ExecutionState,
    channel: WorkerChannel,
}

impl StateBroadcaster {
    pub fn new(channel: WorkerChannel) -> Self {
        Self {
            state: ExecutionState::default(),
            channel,
        }
    }

    pub fn current(&self) -> ExecutionState {
        self.state
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.update(|state| state.paused = paused);
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.update(|state| state.pending = pending);
    }

    pub fn set_paused_til_next(&mut self, paused_til_next: bool) {
        self.update(|state| state.paused_til_next = paused_til_next);
    }

    fn update(&mut self, change: impl FnOnce(&mut ExecutionState)) {
        let mut next = self.state;
        change(&mut next);
        if next != self.state {
            self.state = next;
            self.channel
                .broadcast_universally(Message::UpdateExecutionState(next));
        }
    }
}

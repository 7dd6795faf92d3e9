//! Cooperative breakpoints for step debugging
//!
//! The sandbox awaits [`Breakpoints::before_instruction`] and
//! [`Breakpoints::after_instruction`] around every statement. Each side is a
//! [`Gate`]: an armed gate suspends whoever reaches it until it is released,
//! stepped, or the whole execution is broken.

use thiserror::Error;
use tokio::sync::watch;

/// Raised out of a breakpoint wait when the supervisor releases a test early.
/// Not a failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("test execution was released")]
pub struct Break;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct GateState {
    armed: bool,
    generation: u64,
}

/// One suspension point kind (before or after an instruction)
#[derive(Debug)]
pub struct Gate {
    state: watch::Sender<GateState>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.state.borrow().armed
    }

    /// Suspend the next arrival; a no-op when already armed
    pub fn arm(&self) {
        self.state.send_if_modified(|state| {
            if state.armed {
                false
            } else {
                state.armed = true;
                true
            }
        });
    }

    /// Let current waiters through but stay armed for the next arrival
    pub fn step(&self) {
        self.state.send_modify(|state| {
            state.armed = true;
            state.generation += 1;
        });
    }

    /// Disarm and let every waiter through
    pub fn release(&self) {
        self.state.send_if_modified(|state| {
            if state.armed {
                state.armed = false;
                state.generation += 1;
                true
            } else {
                false
            }
        });
    }

    async fn wait(&self, broken: &watch::Sender<bool>) -> Result<(), Break> {
        let mut broken = broken.subscribe();
        if *broken.borrow_and_update() {
            return Err(Break);
        }

        let mut state = self.state.subscribe();
        let entered = *state.borrow_and_update();
        if !entered.armed {
            return Ok(());
        }

        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let now = *state.borrow_and_update();
                    if !now.armed || now.generation != entered.generation {
                        return Ok(());
                    }
                }
                changed = broken.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if *broken.borrow_and_update() {
                        return Err(Break);
                    }
                }
            }
        }
    }
}

/// Before/after breakpoints plus the "break" signal for one worker
#[derive(Debug)]
pub struct Breakpoints {
    before: Gate,
    after: Gate,
    broken: watch::Sender<bool>,
}

impl Default for Breakpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Breakpoints {
    pub fn new() -> Self {
        let (broken, _) = watch::channel(false);
        Self {
            before: Gate::new(),
            after: Gate::new(),
            broken,
        }
    }

    /// Stop before the next instruction
    pub fn pause(&self) {
        self.before.arm();
    }

    /// Run exactly one more instruction, then stop after it
    pub fn run_till_next(&self) {
        self.before.release();
        self.after.step();
    }

    pub fn resume(&self) {
        self.before.release();
        self.after.release();
    }

    /// Unwind every current and future wait with [`Break`]
    pub fn break_execution(&self) {
        self.broken.send_replace(true);
    }

    pub fn is_broken(&self) -> bool {
        *self.broken.borrow()
    }

    /// Clear the break signal and every armed gate before a new test
    pub fn reset(&self) {
        self.broken.send_replace(false);
        self.resume();
    }

    #[cfg(test)]
    fn is_paused(&self) -> bool {
        self.before.is_armed() || self.after.is_armed()
    }

    pub async fn before_instruction(&self) -> Result<(), Break> {
        self.before.wait(&self.broken).await
    }

    pub async fn after_instruction(&self) -> Result<(), Break> {
        self.after.wait(&self.broken).await
    }

    /// Resolves once the execution has been broken
    pub async fn broken(&self) {
        let mut broken = self.broken.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = broken.wait_for(|broken| *broken).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_unarmed_gate_passes() {
        let breakpoints = Breakpoints::new();
        let mut wait = task::spawn(breakpoints.before_instruction());
        assert_eq!(assert_ready!(wait.poll()), Ok(()));
    }

    #[test]
    fn test_pause_then_resume() {
        let breakpoints = Breakpoints::new();
        breakpoints.pause();

        let mut wait = task::spawn(breakpoints.before_instruction());
        assert_pending!(wait.poll());

        breakpoints.resume();
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()), Ok(()));
        assert!(!breakpoints.is_paused());
    }

    #[test]
    fn test_run_till_next_steps_once() {
        let breakpoints = Breakpoints::new();
        breakpoints.pause();

        let mut before = task::spawn(breakpoints.before_instruction());
        assert_pending!(before.poll());

        breakpoints.run_till_next();
        assert_eq!(assert_ready!(before.poll()), Ok(()));

        // the instruction ran; the after gate now holds
        let mut after = task::spawn(breakpoints.after_instruction());
        assert_pending!(after.poll());

        // stepping again releases this waiter but catches the next one
        breakpoints.run_till_next();
        assert_eq!(assert_ready!(after.poll()), Ok(()));
        let mut next_after = task::spawn(breakpoints.after_instruction());
        assert_pending!(next_after.poll());
    }

    #[test]
    fn test_break_unwinds_waiters() {
        let breakpoints = Breakpoints::new();
        breakpoints.pause();

        let mut wait = task::spawn(breakpoints.before_instruction());
        assert_pending!(wait.poll());

        breakpoints.break_execution();
        assert!(breakpoints.is_broken());
        assert_eq!(assert_ready!(wait.poll()), Err(Break));

        // later arrivals unwind too, even at unarmed gates
        let mut later = task::spawn(breakpoints.after_instruction());
        assert_eq!(assert_ready!(later.poll()), Err(Break));

        breakpoints.reset();
        assert!(!breakpoints.is_broken());
        let mut fresh = task::spawn(breakpoints.before_instruction());
        assert_eq!(assert_ready!(fresh.poll()), Ok(()));
    }

    #[test]
    fn test_arm_is_idempotent() {
        let gate = Gate::new();
        gate.arm();
        gate.arm();
        assert!(gate.is_armed());
        gate.release();
        assert!(!gate.is_armed());
    }
}

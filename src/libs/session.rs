//! Per-connection session state the front end threads through one
//! dispatch loop: the active run mode and the flag that gates stop-reason
//! polling, §4.2 "Run-state coordination" / §4.4.

use crate::libs::backend::RunMode;

/// Tracks whether the front end currently owes the debugger a deferred
/// `T%02x` stop-reason reply, and the CPU-timeout counter that bounds how
/// long a `CONTINUE` is allowed to run before the front end forces a stop.
pub struct Session {
    pub run_mode: RunMode,
    pub waiting_for_stop_reason: bool,
    pub xlen: u32,
    cpu_timeout_ticks: u32,
    cpu_timeout_budget: u32,
}

impl Session {
    pub fn new(xlen: u32, cpu_timeout_budget: u32) -> Self {
        Session {
            run_mode: RunMode::Paused,
            waiting_for_stop_reason: false,
            xlen,
            cpu_timeout_ticks: 0,
            cpu_timeout_budget,
        }
    }

    /// Enter `CONTINUE`/`STEP` and arm the deferred stop-reason reply.
    pub fn on_resume(&mut self, mode: RunMode) {
        self.run_mode = mode;
        self.waiting_for_stop_reason = true;
        self.cpu_timeout_ticks = 0;
    }

    /// A `^C` has been translated into a halt request but the target has
    /// not yet reported `allhalted` — the transient state of §4.4.
    pub fn on_interrupt_requested(&mut self) {
        self.run_mode = RunMode::PauseRequested;
    }

    /// The back end reported the target halted; clears the deferred flag.
    pub fn on_halted(&mut self) {
        self.run_mode = RunMode::Paused;
        self.waiting_for_stop_reason = false;
        self.cpu_timeout_ticks = 0;
    }

    /// Advances the CPU-timeout counter while `CONTINUE`; returns `true`
    /// once the budget from §4.2's "monotone counter" is exhausted.
    pub fn tick_cpu_timeout(&mut self) -> bool {
        if self.run_mode != RunMode::Continue {
            return false;
        }
        self.cpu_timeout_ticks += 1;
        self.cpu_timeout_ticks >= self.cpu_timeout_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_paused_and_not_waiting() {
        let session = Session::new(32, 10);
        assert_eq!(session.run_mode, RunMode::Paused);
        assert!(!session.waiting_for_stop_reason);
    }

    #[test]
    fn resume_arms_the_deferred_stop_reason_flag() {
        let mut session = Session::new(32, 10);
        session.on_resume(RunMode::Continue);
        assert!(session.waiting_for_stop_reason);
        assert_eq!(session.run_mode, RunMode::Continue);
    }

    #[test]
    fn cpu_timeout_only_ticks_while_continuing() {
        let mut session = Session::new(32, 3);
        session.on_resume(RunMode::Step);
        assert!(!session.tick_cpu_timeout());
        session.run_mode = RunMode::Continue;
        assert!(!session.tick_cpu_timeout());
        assert!(!session.tick_cpu_timeout());
        assert!(session.tick_cpu_timeout());
    }

    #[test]
    fn halted_clears_waiting_flag_and_resets_timeout() {
        let mut session = Session::new(32, 1);
        session.on_resume(RunMode::Continue);
        session.tick_cpu_timeout();
        session.on_halted();
        assert!(!session.waiting_for_stop_reason);
        assert_eq!(session.run_mode, RunMode::Paused);
    }
}

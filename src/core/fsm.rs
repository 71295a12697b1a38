//! C5: typed engine lifecycle with explicit transition table and
//! write-once terminal enforcement (spec §3 Engine State, §4.5).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Idle,
    WarmingUp,
    Starting,
    Encoding,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed | EngineState::Cancelled)
    }

    /// Allowed successors, exactly the forward arrows in spec §2/§3: no
    /// back-edges, and any non-terminal state may fail or be cancelled.
    fn allowed_successors(self) -> &'static [EngineState] {
        use EngineState::*;
        match self {
            Idle => &[WarmingUp, Failed, Cancelled],
            WarmingUp => &[Starting, Failed, Cancelled],
            Starting => &[Encoding, Failed, Cancelled],
            Encoding => &[Finalizing, Failed, Cancelled],
            Finalizing => &[Done, Failed, Cancelled],
            Done | Failed | Cancelled => &[],
        }
    }
}

/// `{job_id, from, to, terminal, ...meta}` payload passed to the transition
/// observer, synchronously, on every successful transition (spec §4.5).
pub struct TransitionEvent<'a> {
    pub job_id: &'a str,
    pub from: EngineState,
    pub to: EngineState,
    pub terminal: bool,
    pub meta: Value,
}

pub type TransitionObserver<'a> = dyn Fn(TransitionEvent) + 'a;

pub struct EngineFsm<'a> {
    job_id: String,
    state: EngineState,
    observer: Option<Box<TransitionObserver<'a>>>,
}

impl<'a> EngineFsm<'a> {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: EngineState::Idle,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl Fn(TransitionEvent) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn get_state(&self) -> EngineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Fails with `InvalidTransition` when `next` is not in the allowed
    /// successor set, and with `TerminalAlreadyCommitted` once the FSM has
    /// already entered a terminal state (spec §4.5).
    pub fn transition(&mut self, next: EngineState, meta: Value) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::TerminalAlreadyCommitted {
                state: format!("{:?}", self.state),
            });
        }
        if !self.state.allowed_successors().contains(&next) {
            return Err(CoreError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        let from = self.state;
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(TransitionEvent {
                job_id: &self.job_id,
                from,
                to: next,
                terminal: next.is_terminal(),
                meta,
            });
        }
        Ok(())
    }

    /// Guard that every progress emission must pass (spec §4.5, §4.7).
    pub fn assert_can_emit_progress(&self) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::ProgressAfterTerminal {
                state: format!("{:?}", self.state),
            });
        }
        Ok(())
    }

    /// Symmetric guard for perf-snapshot updates (spec §4.5).
    pub fn assert_can_mutate_metrics(&self, _label: &str) -> Result<(), CoreError> {
        self.assert_can_emit_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_sequence_succeeds() {
        let mut fsm = EngineFsm::new("job-1");
        fsm.transition(EngineState::WarmingUp, Value::Null).unwrap();
        fsm.transition(EngineState::Starting, Value::Null).unwrap();
        fsm.transition(EngineState::Encoding, Value::Null).unwrap();
        fsm.transition(EngineState::Finalizing, Value::Null).unwrap();
        fsm.transition(EngineState::Done, Value::Null).unwrap();
        assert!(fsm.is_terminal());
        assert!(fsm.assert_can_emit_progress().is_err());
    }

    #[test]
    fn rejects_back_edges() {
        let mut fsm = EngineFsm::new("job-1");
        fsm.transition(EngineState::WarmingUp, Value::Null).unwrap();
        fsm.transition(EngineState::Starting, Value::Null).unwrap();
        let err = fsm.transition(EngineState::WarmingUp, Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn terminal_is_write_once() {
        let mut fsm = EngineFsm::new("job-1");
        fsm.transition(EngineState::WarmingUp, Value::Null).unwrap();
        fsm.transition(EngineState::Failed, Value::Null).unwrap();
        let err = fsm.transition(EngineState::Done, Value::Null).unwrap_err();
        assert!(matches!(err, CoreError::TerminalAlreadyCommitted { .. }));
    }

    #[test]
    fn observer_receives_transition_events() {
        let seen = std::cell::RefCell::new(Vec::new());
        let mut fsm = EngineFsm::new("job-1").with_observer(|ev| {
            seen.borrow_mut().push((ev.from, ev.to, ev.terminal));
        });
        fsm.transition(EngineState::WarmingUp, Value::Null).unwrap();
        fsm.transition(EngineState::Cancelled, Value::Null).unwrap();
        let recorded = seen.borrow();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[1].2);
    }
}

// Lifecycle of one traversal: forward execution, optional compensation, end.
// Events arriving in the wrong phase are logged and ignored.

use statig::prelude::*;

use crate::domain::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    StateCompleted { state: String },
    BeginCompensation,
    Suspend,
    Finish { status: ExecutionStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Forward,
    Compensating,
    Suspended,
    Finished,
}

#[derive(Debug, Default)]
pub struct TraversalPhase {
    pub instance_id: String,
    pub phase: Phase,
    pub states_completed: u32,
    pub final_status: Option<ExecutionStatus>,
    pub rejected_events: u32,
}

impl TraversalPhase {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn reject(&mut self, event: &PhaseEvent) {
        self.rejected_events += 1;
        tracing::error!(
            instance_id = %self.instance_id,
            phase = ?self.phase,
            event = ?event,
            "Traversal event not valid in current phase"
        );
    }

    fn finish(&mut self, status: ExecutionStatus) {
        self.phase = Phase::Finished;
        self.final_status = Some(status);
        tracing::debug!(
            instance_id = %self.instance_id,
            status = %status,
            states_completed = self.states_completed,
            "Traversal finished"
        );
    }
}

#[state_machine(initial = "State::idle()")]
impl TraversalPhase {
    #[state]
    fn idle(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Start => {
                self.phase = Phase::Forward;
                Transition(State::forward())
            }
            _ => {
                self.reject(event);
                Handled
            }
        }
    }

    #[state]
    fn forward(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::StateCompleted { state } => {
                self.states_completed += 1;
                tracing::trace!(instance_id = %self.instance_id, state = %state, "State completed");
                Handled
            }
            PhaseEvent::BeginCompensation => {
                self.phase = Phase::Compensating;
                tracing::info!(instance_id = %self.instance_id, "Entering compensation");
                Transition(State::compensating())
            }
            PhaseEvent::Suspend => {
                self.phase = Phase::Suspended;
                Transition(State::suspended())
            }
            PhaseEvent::Finish { status } => {
                self.finish(*status);
                Transition(State::finished())
            }
            PhaseEvent::Start => {
                self.reject(event);
                Handled
            }
        }
    }

    #[state]
    fn compensating(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Finish { status } => {
                self.finish(*status);
                Transition(State::finished())
            }
            _ => {
                self.reject(event);
                Handled
            }
        }
    }

    #[state]
    fn suspended(&mut self, event: &PhaseEvent) -> Outcome<State> {
        self.reject(event);
        Handled
    }

    #[state]
    fn finished(&mut self, event: &PhaseEvent) -> Outcome<State> {
        self.reject(event);
        Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_then_compensation_then_finish() {
        let mut sm = TraversalPhase::new("i-1").state_machine();

        sm.handle(&PhaseEvent::Start);
        assert_eq!(sm.inner().phase(), Phase::Forward);

        sm.handle(&PhaseEvent::StateCompleted { state: "A".to_string() });
        sm.handle(&PhaseEvent::BeginCompensation);
        assert_eq!(sm.inner().phase(), Phase::Compensating);

        sm.handle(&PhaseEvent::Finish { status: ExecutionStatus::Failed });
        assert!(sm.inner().is_finished());
        assert_eq!(sm.inner().final_status, Some(ExecutionStatus::Failed));
        assert_eq!(sm.inner().states_completed, 1);
        assert_eq!(sm.inner().rejected_events, 0);
    }

    #[test]
    fn test_events_after_finish_are_rejected() {
        let mut sm = TraversalPhase::new("i-1").state_machine();

        sm.handle(&PhaseEvent::Start);
        sm.handle(&PhaseEvent::Finish { status: ExecutionStatus::Succeeded });
        sm.handle(&PhaseEvent::BeginCompensation);
        sm.handle(&PhaseEvent::Finish { status: ExecutionStatus::Failed });

        assert_eq!(sm.inner().final_status, Some(ExecutionStatus::Succeeded));
        assert_eq!(sm.inner().rejected_events, 2);
    }

    #[test]
    fn test_compensation_cannot_start_before_forward() {
        let mut sm = TraversalPhase::new("i-1").state_machine();

        sm.handle(&PhaseEvent::BeginCompensation);
        assert_eq!(sm.inner().phase(), Phase::Idle);
        assert_eq!(sm.inner().rejected_events, 1);
    }
}

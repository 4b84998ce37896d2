// Per-query phase state machine
use super::QueryError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    Idle,
    Segmenting,
    Embedding,
    Dispatching,
    /// Dispatch ended before every segment settled (early termination or a
    /// best-effort deadline)
    EarlyTerminated,
    FullyDispatched,
    Aggregating,
    Enforcing,
    Accepted,
    Rejected,
    Failed,
}

impl QueryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Failed)
    }

    /// Whether `next` may follow this phase
    pub fn can_advance_to(&self, next: QueryPhase) -> bool {
        use QueryPhase::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Segmenting)
                | (Segmenting, Embedding)
                | (Embedding, Dispatching)
                | (Dispatching, EarlyTerminated)
                | (Dispatching, FullyDispatched)
                // Multi-scale escalation re-enters dispatch
                | (EarlyTerminated, Dispatching)
                | (FullyDispatched, Dispatching)
                | (EarlyTerminated, Aggregating)
                | (FullyDispatched, Aggregating)
                | (Aggregating, Enforcing)
                | (Enforcing, Accepted)
                | (Enforcing, Rejected)
        )
    }
}

/// Current phase plus every phase visited
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    phase: QueryPhase,
    trace: Vec<QueryPhase>,
}

impl QueryState {
    pub fn new() -> Self {
        Self {
            phase: QueryPhase::Idle,
            trace: vec![QueryPhase::Idle],
        }
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub fn trace(&self) -> &[QueryPhase] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<QueryPhase> {
        self.trace
    }

    pub fn advance(&mut self, next: QueryPhase) -> Result<(), QueryError> {
        if !self.phase.can_advance_to(next) {
            return Err(QueryError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.trace.push(next);
        Ok(())
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use QueryPhase::*;

    #[test]
    fn test_happy_path() {
        let mut state = QueryState::new();
        for phase in [
            Segmenting,
            Embedding,
            Dispatching,
            FullyDispatched,
            Aggregating,
            Enforcing,
            Accepted,
        ] {
            state.advance(phase).unwrap();
        }
        assert_eq!(state.phase(), Accepted);
        assert_eq!(state.trace().len(), 8);
    }

    #[test]
    fn test_escalation_reenters_dispatch() {
        let mut state = QueryState::new();
        for phase in [Segmenting, Embedding, Dispatching, EarlyTerminated, Dispatching, FullyDispatched] {
            state.advance(phase).unwrap();
        }
        assert_eq!(state.phase(), FullyDispatched);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut state = QueryState::new();
        state.advance(Failed).unwrap();
        assert!(state.advance(Segmenting).is_err());
        assert!(state.advance(Failed).is_err());
    }

    #[test]
    fn test_skipping_phases_rejected() {
        let mut state = QueryState::new();
        assert_eq!(
            state.advance(Aggregating),
            Err(QueryError::InvalidTransition {
                from: Idle,
                to: Aggregating
            })
        );
        state.advance(Segmenting).unwrap();
        assert!(state.advance(Accepted).is_err());
    }
}

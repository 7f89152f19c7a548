//! Shared application state for the HTTP server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use labscript::controller::ControllerConfig;
use labscript::core::types::IterationEvent;
use labscript::io::config::LabscriptConfig;
use labscript::io::simulator::ProcessSimulator;
use serde::Serialize;
use tokio::sync::broadcast;

/// Iteration event tagged with the session that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: u64,
    #[serde(flatten)]
    pub event: IterationEvent,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<LabscriptConfig>,
    pub controller: Arc<ControllerConfig>,
    /// Shared so a resolved validator path is reused across requests.
    pub simulator: Arc<ProcessSimulator>,
    /// Broadcast sender for iteration events of every session.
    pub event_tx: Arc<broadcast::Sender<SessionEvent>>,
    next_session: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: LabscriptConfig) -> Result<Self> {
        let simulator = ProcessSimulator::from_config(&config)?;
        let controller = ControllerConfig::from_config(&config);
        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            config: Arc::new(config),
            controller: Arc::new(controller),
            simulator: Arc::new(simulator),
            event_tx: Arc::new(event_tx),
            next_session: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Allocate a session id; ids start at 1 and never repeat.
    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labscript::core::types::EventKind;

    #[test]
    fn session_ids_increase() {
        let state = AppState::new(LabscriptConfig::default()).expect("state");
        let first = state.next_session_id();
        let second = state.clone().next_session_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn session_event_flattens_the_iteration_event() {
        let event = SessionEvent {
            session_id: 7,
            event: IterationEvent::new(
                2,
                EventKind::SimulationStart {
                    message: "Running simulation (attempt 2)".to_string(),
                },
            ),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["session_id"], 7);
        assert_eq!(json["attempt_number"], 2);
        assert_eq!(json["event_type"], "simulation_start");
    }
}

//! The engine: configuration, the observability sink, and the control loop
//! that drives a turn to completion.

pub mod config;
pub mod events;
pub mod turn;

pub use config::EngineConfig;
pub use events::{EngineEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler};
pub use turn::{ControlLoop, TurnOutcome, TurnReport};

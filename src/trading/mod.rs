//! Trading logic: ingestion, risk gate, sizing, dispatch, settlement, learning.

mod config;
mod dispatcher;
mod engine;
mod ingestor;
mod learner;
mod position_sizer;
pub mod risk_gate;
pub mod settlement;

pub use config::EngineConfig;
pub use dispatcher::{DispatchResult, ExecutionDispatcher};
pub use engine::{ExecutionEngine, RiskSnapshot, SubmitOutcome, RISK_STATE_UNAVAILABLE};
pub use ingestor::{RawPayload, SignalIngestor};
pub use learner::{clamp_confidence, ConfidenceLearner};
pub use position_sizer::{cap_percent, confidence_scale, protective_levels, PositionSizer, SizedOrder};

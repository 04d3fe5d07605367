//! Top-level error handling.
use alarm_relay_common::engine::EngineError;
use alarm_relay_config_store::DatabaseError;
use thiserror::Error;

/// Errors that abort the engine loop without committing the current record.
#[derive(Debug, Error)]
pub(crate) enum RetryEngineError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

//! Error types for the strategy engine

use thiserror::Error;

use crate::validator::Violation;

/// Failure talking to the exchange
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("no credentials configured for '{0}'")]
    MissingCredentials(String),

    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("exchange returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to sign request: {0}")]
    Signing(String),
}

impl ExchangeError {
    /// Credential problems that will not go away by retrying the same keys
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::MissingCredentials(_) | Self::Unauthorized(_) => true,
            Self::Api { status, .. } => *status == 401,
            _ => false,
        }
    }
}

/// Failure reading or writing bot state
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bot {0} not found")]
    BotNotFound(i64),

    #[error("strategy {0} not found")]
    StrategyNotFound(i64),

    #[error("stored record is invalid: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Db(#[from] persistence::DbError),
}

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("invalid strategy ({} violation(s))", .0.len())]
    InvalidStrategy(Vec<Violation>),
}

/// Failure of a supervisor start/stop/pause request
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("bot {0} is already running")]
    AlreadyRunning(i64),

    #[error("bot {0} is not running")]
    NotRunning(i64),

    #[error("bot {0} is already starting or stopping")]
    Busy(i64),

    #[error("bot {bot_id} has an invalid strategy ({} violation(s))", .violations.len())]
    InvalidStrategy {
        bot_id: i64,
        violations: Vec<Violation>,
    },

    #[error("bot task for {0} ended abnormally")]
    TaskFailed(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of one bot cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("strategy is invalid: {0}")]
    InvalidStrategy(String),
}

impl CycleError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exchange(e) if e.is_fatal())
    }
}

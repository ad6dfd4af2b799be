//! Simulator errors

use thiserror::Error;

use crate::pattern::PatternError;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("no ECU hosts DoIP address 0x{0:04X}")]
    UnknownAddress(u16),

    #[error("no pattern matched and no built-in handler")]
    UnknownRequest,

    #[error("script error: {0}")]
    Script(#[from] mlua::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for SimulatorError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

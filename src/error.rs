use crate::router::BanditOperation;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("action set is empty")]
    EmptyActionSet,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of an accelerated implementation. Never leaves the router.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OpsError {
    #[error("{operation} failed: {message}")]
    Failed {
        operation: BanditOperation,
        message: String,
    },
    #[error("{operation} returned invalid output: {message}")]
    InvalidOutput {
        operation: BanditOperation,
        message: String,
    },
    #[error("{operation} panicked: {message}")]
    Panicked {
        operation: BanditOperation,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

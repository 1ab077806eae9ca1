use crate::CoreError;
use tracing::debug;

/// Provisioning state of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Unprovisioned,
    Validating,
    Composing,
    Uploading,
    Provisioned,
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionState::Unprovisioned => write!(f, "unprovisioned"),
            ProvisionState::Validating => write!(f, "validating"),
            ProvisionState::Composing => write!(f, "composing"),
            ProvisionState::Uploading => write!(f, "uploading"),
            ProvisionState::Provisioned => write!(f, "provisioned"),
        }
    }
}

pub fn validate_transition(from: ProvisionState, to: ProvisionState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ProvisionState::Unprovisioned, ProvisionState::Validating)
            | (ProvisionState::Validating, ProvisionState::Composing)
            | (ProvisionState::Composing, ProvisionState::Uploading)
            | (ProvisionState::Uploading, ProvisionState::Provisioned)
            | (
                ProvisionState::Validating
                    | ProvisionState::Composing
                    | ProvisionState::Uploading,
                ProvisionState::Unprovisioned
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Tracks the state of one build through its phases.
#[derive(Debug)]
pub struct Provisioning {
    target: String,
    state: ProvisionState,
}

impl Provisioning {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: ProvisionState::Unprovisioned,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn advance(&mut self, to: ProvisionState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("{}: {} -> {to}", self.target, self.state);
        self.state = to;
        Ok(())
    }

    /// Return to `Unprovisioned` after a failed phase.
    pub fn fail(&mut self) {
        if !matches!(
            self.state,
            ProvisionState::Unprovisioned | ProvisionState::Provisioned
        ) {
            debug!("{}: {} -> unprovisioned (failed)", self.target, self.state);
            self.state = ProvisionState::Unprovisioned;
        }
    }
}

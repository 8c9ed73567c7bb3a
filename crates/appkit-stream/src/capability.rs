//! Feature-gated components selected once at construction.

use appkit_types::{AppKitError, Result};

/// A component that is either available or switched off by configuration.
///
/// Call sites check the variant explicitly instead of calling into a
/// component that silently does nothing.
#[derive(Debug, Clone)]
pub enum Capability<T> {
    Enabled(T),
    Disabled { feature: &'static str },
}

impl<T> Capability<T> {
    pub fn from_flag(feature: &'static str, enabled: bool, build: impl FnOnce() -> T) -> Self {
        if enabled {
            Capability::Enabled(build())
        } else {
            Capability::Disabled { feature }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Capability::Enabled(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Capability::Enabled(inner) => Some(inner),
            Capability::Disabled { .. } => None,
        }
    }

    /// Borrow the component or fail with an `InvalidRequest` naming the feature.
    pub fn require(&self) -> Result<&T> {
        match self {
            Capability::Enabled(inner) => Ok(inner),
            Capability::Disabled { feature } => Err(AppKitError::InvalidRequest(format!(
                "feature '{feature}' is disabled"
            ))),
        }
    }
}

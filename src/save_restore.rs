// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for save/restore support.
//!
//! A device defines saved state types that are decoupled from its runtime
//! types, so that runtime refactors cannot silently break saved state
//! compatibility, and implements [`SaveRestore`] over them. The wire encoding
//! of the saved state types is the embedding serialization framework's
//! responsibility, not the device's.

#![warn(missing_docs)]

use thiserror::Error;

/// Implemented by objects which can be saved/restored.
pub trait SaveRestore {
    /// The concrete saved state type.
    type SavedState;

    /// Saves the object's state.
    fn save(&mut self) -> Result<Self::SavedState, SaveError>;

    /// Restores the object's state.
    fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError>;
}

/// A save error.
#[derive(Debug, Error)]
pub enum SaveError {
    /// This object does not support saved state.
    #[error("save state not supported")]
    NotSupported,
    /// Save failed due to some other error.
    #[error(transparent)]
    Other(anyhow::Error),
}

/// A restore error.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Custom saved state corruption error.
    #[error("saved state is invalid")]
    InvalidSavedState(#[source] anyhow::Error),
    /// Non-state-related restore failure.
    #[error(transparent)]
    Other(anyhow::Error),
}

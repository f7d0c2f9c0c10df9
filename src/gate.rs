//! Optional human review before the reviewer stage.
//!
//! A [`ReviewGate`] is consulted at most once per chunk, after every
//! content stage has run for the first time and before the reviewer stage
//! is invoked. Approving hands the chunk on to the reviewer; a `Revise`
//! verdict goes through the same [`RevisionRouter`](crate::RevisionRouter)
//! as the reviewer's, counts against the revision budget, and makes the
//! chunk skip the gate on every later pass.
//!
//! The gate is not consulted when the revision budget is zero, since it
//! could only approve.

use std::fmt;

use async_trait::async_trait;

use crate::{Result, ReviewVerdict, StageInput};

/// A human (or any out-of-band) reviewer.
///
/// `input` is the bundle the reviewer stage would receive: the chunk text
/// and every content stage's output.
#[async_trait]
pub trait ReviewGate: Send + Sync {
    /// Returns the verdict for the chunk.
    ///
    /// # Errors
    ///
    /// Any error fails the chunk. Use
    /// [`ReviewVerdict::from_payload`] to decode free-form answers.
    async fn review(&self, input: &StageInput) -> Result<ReviewVerdict>;
}

/// Answers with a closure.
pub struct CallbackGate<F> {
    callback: F,
}

impl<F> CallbackGate<F>
where
    F: Fn(&StageInput) -> ReviewVerdict + Send + Sync,
{
    /// Wraps `callback`.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> fmt::Debug for CallbackGate<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackGate").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ReviewGate for CallbackGate<F>
where
    F: Fn(&StageInput) -> ReviewVerdict + Send + Sync,
{
    async fn review(&self, input: &StageInput) -> Result<ReviewVerdict> {
        Ok((self.callback)(input))
    }
}

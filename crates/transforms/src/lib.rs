pub mod remove_builders;

use dexloom_core::CodeBody;
use thiserror::Error;
use tracing::info;

/// Transform error type encompassing all pass failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Method body operation failed in the editing core.
    #[error("method body operation failed: {0}")]
    Core(#[from] dexloom_core::Error),
}

/// Transform result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for rewrites over a single method body.
pub trait MethodPass {
    /// The pass's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Apply the pass, returning whether the body changed.
    fn apply(&self, body: &mut CodeBody) -> Result<bool>;
}

/// Run a sequence of passes over one method body.
pub fn run_passes(body: &mut CodeBody, passes: &[Box<dyn MethodPass>]) -> Result<()> {
    for pass in passes {
        let changed = pass.apply(body)?;
        info!("{:>16} changed={}", pass.name(), changed);
    }
    Ok(())
}

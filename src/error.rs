// Error taxonomy
//
// Three classes of failure:
// - Stale swapchain: not an error at all, see `gpu::AcquireOutcome` and
//   `frame::FrameOutcome`
// - Contract violations: `EngineError`, reported to the caller and logged
// - Everything else (device lost, OOM, shader failures): `anyhow::Error`,
//   propagated straight up to the binary which exits

use crate::model::ModelHandle;

/// Errors a caller of the engine API can match on
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Model requested at a (pass, subpass) the render graph doesn't have
    #[error("no subpass {subpass} in render pass {pass}")]
    InvalidPlacement { pass: usize, subpass: usize },

    /// Handle is not (or no longer) in the registry
    #[error("unknown model handle {0}")]
    UnknownModel(ModelHandle),

    /// A delete for this handle is already queued
    #[error("model {0} already has a pending delete")]
    DeletePending(ModelHandle),

    /// Every non-zero handle is in use
    #[error("model handle space exhausted")]
    HandlesExhausted,

    /// Uniform write larger than the region reserved for it
    #[error("uniform data of {len} bytes does not fit region of {capacity} bytes")]
    UniformTooLarge { len: usize, capacity: usize },

    /// The background loader has shut down
    #[error("background loader is not running")]
    LoaderStopped,
}

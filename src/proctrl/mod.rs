// Process control: the per-traversal execution context

pub mod context;

pub use context::{Frame, FramePhase, ProcessContext, FORCE_COMPENSATION_VAR};

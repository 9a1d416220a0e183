pub mod classify;
pub mod id_ctx;
pub mod id_flow;

pub use classify::IdOutcome;
pub use id_ctx::IdCtx;
pub use id_flow::IdFlow;

//! Orchestration layer of the insights pipeline.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`egress`] | Concurrency + rate gate for outbound analysis calls |
//! | [`analysis`] | Analysis Client: prompt, retry, normalisation, parsing, fallback |
//! | [`batch`] | Batch Orchestrator: discovery, claiming, fan-out, commit |
//! | [`clock`] | `Clock` on tokio's timer |
//!
//! Nothing here touches the network or disk directly; it is wired to a
//! [`pipeline::WorkStore`] and a [`pipeline::AnalysisService`] by the
//! composition root.

pub mod analysis;
pub mod batch;
pub mod clock;
pub mod egress;

pub use analysis::{AnalysisClient, AnalysisConfig};
pub use batch::{BatchConfig, BatchOrchestrator, CycleError, CycleReport};
pub use clock::TokioClock;
pub use egress::{EgressClosed, EgressConfig, EgressLimiter, EgressPermit};

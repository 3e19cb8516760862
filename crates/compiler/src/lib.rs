//! Study-packet compilation: skeleton planning, the per-phase specialist
//! stages and the driver that turns canonical segments into a [`Packet`].
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** This crate sequences model calls and the
//! deterministic algorithms in the [`packet`] crate. It talks to the model only
//! through [`packet::LlmGateway`] and to storage only through
//! [`packet::KeyValueStore`]; it owns no transport or file format.
//!
//! ## Flow
//!
//! 1. [`planner::plan`] partitions the ordered segments into skeleton phases.
//! 2. For each phase, in order, [`Orchestrator::run_phase`] runs
//!    decomposition, sense assignment (with dictionary hints), alignment and
//!    layout, then rehydrates a phase view. Failed stages degrade the phase
//!    instead of failing it.
//! 3. [`validate_packet`](packet::validate::validate_packet) checks coverage
//!    and text integrity across the finished packet.
//!
//! Every model call goes through one [`CallGateway`], whose [`Throttle`]
//! spaces call starts by a minimum gap.
//!
//! [`Packet`]: packet::Packet

pub mod compile;
pub mod config;
pub mod gateway;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod stages;
pub mod throttle;

pub use compile::{CompileRequest, NoProgress, PacketCompiler, ProgressSink};
pub use config::{CompilerConfig, StageToggles, TokenLimits};
pub use gateway::{CallGateway, CallSpec, RetryPolicy};
pub use orchestrator::{AssemblyPath, Orchestrator, PhaseOutcome};
pub use planner::Plan;
pub use stages::{DictionaryHints, DictionaryStep, PhaseInput};
pub use throttle::Throttle;

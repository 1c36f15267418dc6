//! Traincard Adapters
//!
//! Glue between training frameworks and `traincard_core::Reporter`:
//! - A framework-neutral hook vocabulary (`HookKind`, `HookPayload`)
//! - The adapter capability every framework integration implements (`FrameworkAdapter`)
//! - A trainer-callback adapter for Hugging-Face-style lifecycle hooks
//! - System telemetry sampling (`HostSampler` by default, any `SystemSampler` pluggable)

pub mod callback;
pub mod hooks;
pub mod sampler;

pub use callback::{default_namespace, TrainerCallbackAdapter};
pub use hooks::{FrameworkAdapter, HookError, HookKind, HookPayload};
pub use sampler::{FnSampler, HostSampler, NoopSampler, SystemSampler};

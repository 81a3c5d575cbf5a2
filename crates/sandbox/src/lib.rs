//! Sandbox Executor (C7): runs a validated [`Plan`] step by step under a
//! wall-clock deadline, with no claim of real OS-level isolation — only
//! substring/pattern hardening applied a second time, in front of the
//! subprocess boundary, as a defense-in-depth gate alongside the command
//! validator that already ran upstream.

pub mod executor;

pub use executor::{ExecutionResult, SandboxExecutor, StepOutcome};

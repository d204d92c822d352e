//! The core's error boundary: a plain `anyhow::Result`, `bail!`/`anyhow!` at
//! the call site for the handful of fallible paths (codec failures,
//! transport faults, bad configuration).
//!
//! Protocol precondition violations (calling `leave_cs` off-CS, `wait`
//! off-CS, a stale `REQUEST`) are *not* represented here: the public API
//! treats those as forgiving no-ops, observable only through `tracing`.

pub use anyhow::{anyhow, bail, Result};

//! A distributed monitor: mutual exclusion, condition-variable-style
//! waiting, and a replicated shared datum across a fixed group of peers
//! communicating only by broadcast.
//!
//! The core is a Suzuki-Kasami single-token mutual exclusion algorithm
//! fused with a monitor's wait/notify layer and a last-writer-wins
//! replicated value. See [`Monitor`] for the public API.

mod config;
mod error;
mod message;
mod monitor;
mod state;
mod transport;

pub use config::Config;
pub use error::Result;
pub use message::{Message, Sn, Token};
pub use monitor::Monitor;
pub use state::ProcessState;
pub use transport::{InProcessBus, Transport};

//! Wire protocol definitions for the viewer ↔ analysis-engine channel.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other host frontends without pulling in heavier runtime code.

pub mod methods;
pub mod requests;
pub mod rpc;
pub mod types;

pub use requests::*;
pub use rpc::*;
pub use types::*;

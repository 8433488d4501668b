//! Local interprocess channels of the slot protocol.
//!
//! Three logical addresses: the control channel (slot Acquire/Release), one
//! inference-request channel per worker, and one completion address per
//! handler client id.

pub mod channel;
pub mod completion;
pub mod deadline;
pub mod error;
pub mod frame;
pub mod layout;
pub mod message;

pub use channel::*;
pub use completion::*;
pub use deadline::*;
pub use error::*;
pub use frame::Parts;
pub use layout::*;
pub use message::*;

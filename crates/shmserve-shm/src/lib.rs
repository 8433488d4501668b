//! Shared buffer arena: fixed, named input/output regions plus a shared
//! table recording which side of the protocol owns each slot.

pub mod arena;
pub mod error;
pub mod meta;
pub mod region;
pub mod slot;

pub use arena::*;
pub use error::*;
pub use meta::*;
pub use region::*;
pub use slot::*;

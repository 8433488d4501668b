pub mod directory;
pub mod error;
pub mod executor;
pub mod spec;
pub mod tensor;

pub use directory::*;
pub use error::*;
pub use executor::*;
pub use spec::*;
pub use tensor::*;

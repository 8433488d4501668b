pub mod config;
pub mod connection;
pub mod handler;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod request;
pub mod slot_table;
pub mod worker;

pub use config::*;
pub use connection::*;
pub use handler::*;
pub use manager::*;
pub use pool::*;
pub use registry::*;
pub use request::*;
pub use slot_table::*;
pub use worker::*;

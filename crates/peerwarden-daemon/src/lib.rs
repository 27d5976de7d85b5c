pub mod alloc;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exec;
pub mod lock;
pub mod owners;
pub mod peers;
pub mod reconcile;
pub mod table;
pub mod tunnel;
pub mod wg;
pub mod wgconf;

pub use error::{CoreError, ErrorKind, Result};

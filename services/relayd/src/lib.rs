pub mod buffer;
pub mod config;
pub mod logging;
pub mod pair;
pub mod server;
pub mod socket;
pub mod worker;

pub use config::{Args, RelayTuple};
pub use server::{RelayServer, ServerHandle};

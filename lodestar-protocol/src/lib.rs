pub mod client;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod transport;

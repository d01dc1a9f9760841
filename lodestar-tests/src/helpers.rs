pub mod backend;
pub mod conn;
pub mod harness;
pub mod pipes;

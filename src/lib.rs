// Warden - Library root
//
// A local capability broker: clients on the same host ask the agent over a
// Unix domain socket for short-lived, signed capabilities, which are issued
// only after the policy engine allows the request.

pub mod capability;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod protocol;

pub use error::{Result, WardenError};

//! Vendor REST backend: session management and the command family

pub mod commands;
pub mod session;

pub use commands::{Command, PowerMode};
pub use session::{CloudSession, Device, Region};

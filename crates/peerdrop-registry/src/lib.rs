//! peerdrop Registry - liveness-tracked peer discovery over HTTP

pub mod directory;
pub mod handler;

pub use directory::{Registry, RegistryEntry};
pub use handler::{resolve_ip, router, serve};

/// Default registry port
pub const DEFAULT_PORT: u16 = 8000;

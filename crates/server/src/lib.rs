// Fabula sync server — real-time relay for collaborative dialogue scripts.

pub mod acl;
pub mod config;
pub mod doc;
pub mod protocol;
pub mod registry;
pub mod snapshot;
pub mod ws;

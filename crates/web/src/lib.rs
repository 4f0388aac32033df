//! relaykit Status Server
//!
//! Serves the share-link page, the optional static landing page and a
//! plain-text status fallback.

pub mod server;
pub mod static_files;

pub use server::{bind_dual_stack, StatusServer, StatusServerConfig};

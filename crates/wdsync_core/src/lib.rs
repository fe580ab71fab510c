//! Remote synchronization of local page buffers with wikidot sites.

pub mod accounts;
pub mod config;
pub mod edit;
pub mod error;
pub mod frontmatter;
pub mod host;
pub mod merge;
pub mod names;
pub mod page;
pub mod preview;
pub mod revuri;
pub mod runtime;
pub mod scrape;
pub mod session;
pub mod state;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{AuthFailure, ProtocolFailure, Result, WikidotError};

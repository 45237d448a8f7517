//! Transactional filesystem broker for autonomous code-editing agents.
//!
//! Every read issues a line-access token; every edit must present one
//! that still matches the file. Mutations run inside nestable journal
//! transactions with undo/redo, paths pass through a single sandbox
//! choke-point, and out-of-band edits are detected and journaled. The
//! MCP host adapter lives in the sibling `filebroker-mcp-server` crate;
//! this crate is runtime-agnostic and purely synchronous.

pub mod config;
pub mod context;
pub mod digest;
pub mod encoding;
pub mod error;
pub mod fsio;
pub mod journal;
pub mod lines;
pub mod ops;
pub mod sandbox;
pub mod symbols;
pub mod token;
pub mod tracker;

pub use config::Config;
pub use config::ConfigOverrides;
pub use context::BrokerContext;
pub use error::BrokerErr;
pub use error::Result;

//! External-interface adapters (spec.md §4.9): traits for the collaborators
//! named in spec.md §1/§6 that are out of scope to reimplement, each paired
//! with a small in-memory or in-process reference implementation.

pub mod catalog;
pub mod peer_node;

pub use catalog::{InMemoryCatalog, MetaCatalog};
pub use peer_node::{LocalPeerNode, PeerNode, RemotePeerNode};

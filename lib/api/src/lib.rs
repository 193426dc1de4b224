//! Wire-adjacent types and RPC-transport scaffolding for the query node.
//!
//! spec.md §1 puts "RPC transport and grpc scaffolding" out of scope for
//! re-implementation — the actual request/response payloads of §6.3 belong
//! to the coordinator/proto contract, not this crate. What stays in scope
//! here is the one-pool-per-node connection cache spec.md §5 calls for
//! (`grpc::transport_channel_pool`), kept as its own crate the way the
//! teacher keeps `api` as the dependency-light edge crate every other
//! crate sits behind.

pub mod grpc;

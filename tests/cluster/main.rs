//! Integration tests for replicated nodes.
//!
//! These run several `VectorNode`s with real driver threads on an
//! in-process network (and one suite over loopback TCP), then check what
//! the gateway-facing API observes on every replica.

#[path = "../common/mod.rs"]
mod common;

mod gateway;
mod membership;
mod replication;
mod tcp;

//! # pickcluster-tests
//!
//! Integration tests for the pickcluster node.
//!
//! - End-to-end tests running real nodes over loopback TCP
//! - Property-based tests for the wire codec and difficulty encoding

pub mod harness;

#[cfg(test)]
mod node_tests;


pub use harness::*;

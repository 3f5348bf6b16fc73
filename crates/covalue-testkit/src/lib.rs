//! # CoValue Testkit
//!
//! Testing utilities for CoValue.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: named test nodes and a synchronous message pump
//! - **Generators**: Proptest strategies for sessions, changes and whole logs
//!
//! ## Test Fixtures
//!
//! Run two nodes against each other without a runtime:
//!
//! ```rust
//! use covalue_testkit::fixtures::{connect_pair, deliver_all, TestNode};
//!
//! let mut server = TestNode::new("server", 1);
//! let mut client = TestNode::new("client", 2);
//! connect_pair(&mut server, &mut client);
//!
//! let id = server.create_map().unwrap();
//! client.node.load(id);
//! deliver_all(&mut [&mut server, &mut client]);
//! assert_eq!(client.node.known_state(&id), server.node.known_state(&id));
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalue_testkit::generators::{log_from_params, LogParams};
//!
//! proptest! {
//!     #[test]
//!     fn log_counts_match(params: LogParams) {
//!         let log = log_from_params(&params);
//!         prop_assert_eq!(log.known_state(), &params.expected_known_state(*log.id()));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{connect_pair, deliver_all, memory_storage, multi_party, step, Delivery, TestNode};
pub use generators::{log_from_params, LogParams};

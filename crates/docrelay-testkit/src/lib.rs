//! # docrelay Testkit
//!
//! Testing utilities for docrelay.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: sample documents and an in-memory hub with peers
//! - **Generators**: Proptest strategies for documents and queue entries
//!
//! ## Relay Harness
//!
//! Run a hub and any number of peers over an in-memory network:
//!
//! ```rust,no_run
//! use docrelay_testkit::fixtures::{site, RelayHarness};
//!
//! async fn example() {
//!     let harness = RelayHarness::new(&["A", "B"]);
//!     let a = harness.peer("A");
//!     let b = harness.peer("B");
//!
//!     let (id, _) = a.peer.write("sites", site("x")).await.unwrap();
//!     b.wait_for("sites", &id).await;
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use docrelay_testkit::generators::document;
//!
//! proptest! {
//!     #[test]
//!     fn codec_round_trips(doc in document()) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{fast_pump, site, site_with_id, RelayHarness, TestPeer};
pub use generators::{document, new_entry, object_id, value, EntryParams};

//! Integration tests for mro-lens.
//!
//! These tests run real sessions against the `mro-stub-server` binary built
//! from this package: port allocation, process supervision, connection
//! retries, the protocol bridge and teardown.
//!
//! To run these tests:
//! - Standard run: `cargo test --test integration_test`
//! - With debug output: `RUST_LOG=debug cargo test --test integration_test`
//! - Run single test: `cargo test --test integration_test test_diamond_lenses_in_source_order`
//!
//! Note: Tests are serialized with the `serial_test` crate so sessions do not
//! race each other for ports.

mod bridge_test;
mod common;

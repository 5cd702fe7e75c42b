//! Shared storage integration tests.
//!
//! Tests the PublishedVersionStore contract against every implementation.
//! Each implementation's test target imports this module and runs the macro.

pub mod published_version_store_tests;

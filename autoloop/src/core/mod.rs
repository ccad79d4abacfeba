//! Deterministic, pure logic shared by the loop.
//!
//! Core modules are free of I/O side effects apart from reading the wall
//! clock. They operate on in-memory data and are tested in isolation.

pub mod budget;
pub mod classifier;
pub mod guidance;
pub mod plan;
pub mod scope;
pub mod selector;
pub mod tracker;
pub mod types;

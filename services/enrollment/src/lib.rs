//! hermes enrollment library.
//!
//! This crate primarily ships the `hermes-enrollment` binary, which runs the
//! saga repair loop, but exposes the scheduling engine and its repositories
//! for embedding and integration testing.

pub mod config;
pub mod db;
pub mod model;
pub mod repository;
pub mod scheduling;

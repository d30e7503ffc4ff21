//! extkit - Extension lifecycle manager and extension host
//!
//! Installs editor extensions from an Open VSX compatible registry, keeps
//! their lifecycle state on disk, and loads their static contributions and
//! sandboxed runtimes into an editor surface.
//!
//! This library exposes the core functionality of extkit for both
//! the CLI binary and integration testing.

pub mod activation;
pub mod compatibility;
pub mod config;
pub mod contributions;
pub mod dispose;
pub mod events;
pub mod health;
pub mod host;
pub mod installed;
pub mod jsonc;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod surface;

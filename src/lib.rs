//! inertia-guests: lifecycle management for the macOS and Linux preview
//! guests.
//!
//! The [`vm`] module holds the provisioning pipeline and the lifecycle
//! controller; [`config`], [`paths`] and [`logging`] are the host-side
//! plumbing the `inertia-guests` binary wires around it.

pub mod config;
pub mod logging;
pub mod paths;
pub mod state_machine;
pub mod vm;

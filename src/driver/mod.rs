//! Iteration scheduling.
//!
//! This module owns the session lifecycle: starting a session, polling its
//! status on a fixed interval, and triggering one iteration per idle period
//! without ever letting two trigger calls overlap. UI layers talk to it over
//! channels and never touch its state directly.

mod controller;
mod state;

pub(crate) use controller::{run_driver, UiCommand};

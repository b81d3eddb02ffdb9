//! Turning decoded payloads into actions and folding them onto match state.

pub mod actions;
pub mod controller;
pub mod postprocess;
pub mod scope;

pub use actions::{ActionRegistry, ActionStep, ReplayAction, ReplayActionKind};
pub use controller::{
    ReplayController, ReplayControllerState, ReplayPosition, ReplaySetupContext,
};

//! Folding actions onto match state and navigating a parsed replay.

pub mod context;
#[allow(clippy::module_inception)]
pub mod controller;
pub mod listener;

pub use context::{
    ActivePower, FoldMismatch, GameOverState, Journal, PlayerLedger, ReplaySetupContext,
    TurnCursor, clamp_hit_points,
};
pub use controller::{ReplayController, ReplayPosition};
pub use listener::ReplayControllerState;

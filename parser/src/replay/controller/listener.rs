use std::collections::BTreeMap;

use crate::model::{MatchMetadata, PlayerProfile, ReplayBuilding, ReplayUnit};
use crate::replay::actions::ReplayAction;
use crate::types::{PlayerId, Position, UnitId};

use super::context::{ActivePower, GameOverState, PlayerLedger, TurnCursor};
use super::controller::ReplayPosition;

/// Readonly view into ReplayController state.
///
/// Renderers and exporters read through this so they do not need to own
/// the controller or know how it navigates.
pub trait ReplayControllerState {
    /// Turn index and number of that turn's actions applied
    fn position(&self) -> ReplayPosition;

    fn metadata(&self) -> &MatchMetadata;

    /// Player profiles as listed in the replay
    fn players(&self) -> &[PlayerProfile];

    /// Units on the board, carried units included
    fn units(&self) -> &BTreeMap<UnitId, ReplayUnit>;

    fn buildings(&self) -> &BTreeMap<Position, ReplayBuilding>;

    /// Funds, income, COs and meters per player
    fn ledgers(&self) -> &BTreeMap<PlayerId, PlayerLedger>;

    /// CO powers running right now
    fn active_powers(&self) -> &BTreeMap<PlayerId, ActivePower>;

    /// Whose turn it is, the day and the weather
    fn cursor(&self) -> TurnCursor;

    /// Final standings, once the match is decided
    fn game_over(&self) -> Option<&GameOverState>;

    /// The most recently applied action, if any in the current turn
    fn last_action(&self) -> Option<&ReplayAction>;
}

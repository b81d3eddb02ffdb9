use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::model::ReplayUnit;
use crate::replay::controller::ReplaySetupContext;
use crate::types::{PlayerId, Position, TerrainId, UnitId};

use super::payload::{
    coordinate, field, flag, id, id_field, items, opt_field, opt_int_field, position_field,
    unit_patch,
};
use super::{ActionBuildContext, ActionFrame, ActionStep, Framed};

const CAPTURE_COMPLETE: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathNode {
    pub position: Position,
    pub unit_visible: bool,
}

/// Buildings whose real terrain a move revealed, listed under `discovered`.
pub(crate) fn read_discoveries(
    ctx: &ActionBuildContext<'_>,
    payload: &Value,
) -> Result<Vec<(Position, TerrainId)>> {
    let Some(discovered) = ctx.opt_scoped(payload, "discovered")? else {
        return Ok(Vec::new());
    };
    let Some(buildings) = opt_field(discovered, "buildings") else {
        return Ok(Vec::new());
    };
    items(buildings, "discovered.buildings")?
        .into_iter()
        .map(|building| {
            Ok((
                position_field(building, "buildings_x", "buildings_y")?,
                id_field::<TerrainId>(building, "buildings_terrain_id")?,
            ))
        })
        .collect()
}

pub(crate) fn apply_discoveries(
    ctx: &mut ReplaySetupContext,
    player: PlayerId,
    discovered: &[(Position, TerrainId)],
) -> Result<()> {
    if discovered.is_empty() {
        return Ok(());
    }
    let team = ctx.team_of(player)?.to_owned();
    for (position, terrain) in discovered {
        ctx.register_discovery(&team, *position, *terrain);
    }
    Ok(())
}

/// A unit walking along a path. Every other action may carry one of these
/// to run first.
#[derive(Debug, Clone, Serialize)]
pub struct MoveUnitAction {
    pub player_id: PlayerId,
    pub unit: ReplayUnit,
    pub path: Vec<PathNode>,
    pub distance: i64,
    pub trapped: bool,
    pub discovered: Vec<(Position, TerrainId)>,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl MoveUnitAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        let unit = unit_patch(ctx.scoped(payload, "unit")?)?;
        let path = match ctx.opt_scoped(payload, "paths")? {
            Some(nodes) => items(nodes, "paths")?
                .into_iter()
                .map(|node| {
                    Ok(PathNode {
                        position: Position::new(
                            coordinate(field(node, "x")?, "x")?,
                            coordinate(field(node, "y")?, "y")?,
                        ),
                        unit_visible: opt_field(node, "unit_visible")
                            .map(|value| flag(value, "unit_visible"))
                            .transpose()?
                            .unwrap_or(true),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(MoveUnitAction {
            player_id: ctx.actor(),
            unit,
            path,
            distance: opt_int_field(payload, "dist")?.unwrap_or(0),
            trapped: opt_field(payload, "trapped")
                .map(|value| flag(value, "trapped"))
                .transpose()?
                .unwrap_or(false),
            discovered: read_discoveries(ctx, payload)?,
            frame: ActionFrame::default(),
        })
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit.id
    }

    /// Where the unit ends up: the patch position, else the last path node.
    pub fn destination(&self) -> Option<Position> {
        self.unit
            .position()
            .or_else(|| self.path.last().map(|node| node.position))
    }

    pub fn relocates(&self) -> bool {
        self.distance > 0 || self.path.len() > 1
    }

    fn apply(&self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let id = self.unit.id;
        let origin = ctx.require_unit(id)?.position();

        let mut patch = self.unit.clone();
        if patch.position().is_none() {
            if let Some(destination) = self.destination() {
                patch.set_position(destination);
            }
        }
        ctx.patch_unit(&patch)?;

        let destination = ctx.require_unit(id)?.position();
        if let Some(destination) = destination {
            ctx.move_unit_tree(id, destination)?;
        }

        // A capture in progress is lost once the capturer steps off.
        if let Some(origin) = origin.filter(|origin| Some(*origin) != destination) {
            let interrupted = ctx
                .building(origin)
                .is_some_and(|building| building.capture < CAPTURE_COMPLETE);
            if interrupted {
                ctx.building_mut(origin)?.capture = CAPTURE_COMPLETE;
            }
        }

        apply_discoveries(ctx, self.player_id, &self.discovered)
    }
}

impl Framed for MoveUnitAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for MoveUnitAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let this = &*self;
        let journal = ctx.record(|ctx| this.apply(ctx))?;
        self.frame.set_journal(journal);
        Ok(())
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Move", ctx)
    }
}

/// A unit boarding a transport.
#[derive(Debug, Clone, Serialize)]
pub struct LoadAction {
    pub loaded: UnitId,
    pub transport: UnitId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl LoadAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(LoadAction {
            loaded: id(ctx.scoped(payload, "loaded")?, "loaded")?,
            transport: id(ctx.scoped(payload, "transport")?, "transport")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for LoadAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for LoadAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (loaded, transport) = (self.loaded, self.transport);
        self.frame.setup(ctx, |ctx| {
            let position = ctx.require_unit(transport)?.position();
            let unit = ctx.unit_mut(loaded)?;
            unit.carried = Some(true);
            if let Some(position) = position {
                unit.set_position(position);
            }

            let carrier = ctx.unit_mut(transport)?;
            let mut cargo = carrier.cargo.take().unwrap_or_default();
            if !cargo.contains(&loaded) {
                cargo.push(loaded);
            }
            carrier.cargo = Some(cargo);
            Ok(())
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Load", ctx)
    }
}

/// A unit leaving a transport onto an adjacent tile.
#[derive(Debug, Clone, Serialize)]
pub struct UnloadAction {
    pub transport: UnitId,
    pub unit: ReplayUnit,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl UnloadAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(UnloadAction {
            transport: id(ctx.scoped(payload, "transportID")?, "transportID")?,
            unit: unit_patch(ctx.scoped(payload, "unit")?)?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for UnloadAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for UnloadAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let (transport, patch) = (self.transport, &self.unit);
        self.frame.setup(ctx, |ctx| {
            let id = patch.id;
            ctx.patch_unit(patch)?;
            ctx.unit_mut(id)?.carried = Some(false);

            let carrier = ctx.unit_mut(transport)?;
            if let Some(cargo) = carrier.cargo.as_mut() {
                cargo.retain(|cargo_id| *cargo_id != id);
            }

            if let Some(position) = ctx.require_unit(id)?.position() {
                ctx.move_unit_tree(id, position)?;
            }
            Ok(())
        })
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Unload", ctx)
    }
}

fn set_dive(ctx: &mut ReplaySetupContext, unit: UnitId, dived: bool) -> Result<()> {
    ctx.unit_mut(unit)?.sub_dive = Some(dived);
    Ok(())
}

/// A submarine diving or a stealth fighter hiding.
#[derive(Debug, Clone, Serialize)]
pub struct HideAction {
    pub unit: UnitId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl HideAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(HideAction {
            unit: id(ctx.scoped(payload, "unitId")?, "unitId")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for HideAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for HideAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let unit = self.unit;
        self.frame.setup(ctx, |ctx| set_dive(ctx, unit, true))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Hide", ctx)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnhideAction {
    pub unit: UnitId,
    #[serde(flatten)]
    pub(crate) frame: ActionFrame,
}

impl UnhideAction {
    pub fn from_payload(ctx: &ActionBuildContext<'_>, payload: &Value) -> Result<Self> {
        Ok(UnhideAction {
            unit: id(ctx.scoped(payload, "unitId")?, "unitId")?,
            frame: ActionFrame::new(ctx.nested_move(payload)?),
        })
    }
}

impl Framed for UnhideAction {
    fn frame(&self) -> &ActionFrame {
        &self.frame
    }
}

impl ActionStep for UnhideAction {
    fn setup(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        let unit = self.unit;
        self.frame.setup(ctx, |ctx| set_dive(ctx, unit, false))
    }

    fn undo(&mut self, ctx: &mut ReplaySetupContext) -> Result<()> {
        self.frame.undo("Unhide", ctx)
    }
}

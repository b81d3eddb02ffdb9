use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! wire_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                $name(v)
            }
        }

        impl TryFrom<i64> for $name {
            type Error = crate::Error;

            fn try_from(v: i64) -> Result<Self, Self::Error> {
                u32::try_from(v).map($name).map_err(|_| {
                    crate::Error::malformed(format!(
                        "{} out of range: {v}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

wire_id!(
    /// Server-side match identifier.
    GameId
);
wire_id!(
    /// Per-match player seat identifier (not the account).
    PlayerId
);
wire_id!(
    /// A persistent user account identifier.
    UserId
);
wire_id!(
    /// Unit identifier, unique for the whole match.
    UnitId
);
wire_id!(BuildingId);
wire_id!(
    /// Commanding officer identifier, keys into the CO table.
    CoId
);
wire_id!(
    /// Terrain identifier. For properties this also encodes the owning country.
    TerrainId
);
wire_id!(CountryId);
wire_id!(MapId);

/// Tile coordinate on the map. Origin is the top-left tile.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }

    pub fn manhattan(self, other: Position) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

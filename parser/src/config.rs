use derive_builder::Builder;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

/// Knobs for [`ReplayFile`](crate::ReplayFile) parsing.
///
/// Every field has a default, so a partial TOML or JSON table is enough to
/// build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[builder(default)]
pub struct ParserConfig {
    /// Move end-turn actions logged at the head of the following turn back
    /// to the turn they close
    pub repair_turn_order: bool,
    /// Fold every turn after parsing and reject the replay when a turn does
    /// not reproduce the next snapshot
    pub verify_folds: bool,
    /// Upper bound on the size of any decompressed stream
    pub max_decompressed_bytes: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            repair_turn_order: true,
            verify_folds: false,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }
}

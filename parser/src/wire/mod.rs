//! Readers for the text streams stored inside a replay container.

pub mod action_log;
pub mod decoder;
pub mod snapshot;
pub mod tree;

pub use action_log::{ActionLine, ActionLogReader, MatchedActions};
pub use decoder::{FormatDecoder, INVALID_BYTE, decode_text, parse_flag};
pub use snapshot::{ParsedSnapshots, TurnSnapshotReader};
pub use tree::{TREE_FORMAT_VERSION, TreeReplay};

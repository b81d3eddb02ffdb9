use std::io::{Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Serialize;
use strum_macros::{Display, IntoStaticStr};
use tracing::{Level, debug, span, warn};

use crate::Rc;
use crate::config::ParserConfig;
use crate::error::{Error, Result};
use crate::game_constants::GameConstants;
use crate::model::{ReplayData, TurnData};
use crate::replay::actions::ActionRegistry;
use crate::replay::controller::ReplayController;
use crate::replay::postprocess::relocate_misplaced_end_turns;
use crate::wire::{
    ActionLogReader, MatchedActions, ParsedSnapshots, TreeReplay, TurnSnapshotReader, decode_text,
};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ACTION_LOG_PREFIX: char = 'a';

/// Outer wrapper of a replay download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
pub enum ContainerFormat {
    /// Zip archive holding a gzipped snapshot stream and a gzipped action log
    Zip,
    /// A bare gzipped snapshot stream, as older replays were served
    Gzip,
    /// Structured JSON document
    Tree,
}

impl ContainerFormat {
    pub fn sniff(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            return Ok(ContainerFormat::Zip);
        }
        if bytes.starts_with(GZIP_MAGIC) {
            return Ok(ContainerFormat::Gzip);
        }
        let first = bytes.iter().find(|byte| !byte.is_ascii_whitespace());
        if first == Some(&b'{') {
            return Ok(ContainerFormat::Tree);
        }
        Err(Error::corrupted(format!(
            "unrecognized container, leading bytes {:02x?}",
            &bytes[..bytes.len().min(4)]
        )))
    }

    pub fn decoder(self) -> Box<dyn ReplayFormat> {
        match self {
            ContainerFormat::Zip => Box::new(ZipArchiveFormat),
            ContainerFormat::Gzip => Box::new(LegacyGzipFormat),
            ContainerFormat::Tree => Box::new(TreeFormat),
        }
    }
}

/// Unpacks one container format into parsed snapshots and per-turn action
/// payloads.
pub trait ReplayFormat {
    fn decode(&self, bytes: &[u8], config: &ParserConfig) -> Result<(ParsedSnapshots, MatchedActions)>;
}

/// Reads at most `limit` bytes from `reader`, failing if there is more.
fn read_bounded(reader: impl Read, limit: u64, what: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::corrupted(format!("{what}: {e}")))?;
    if out.len() as u64 > limit {
        return Err(Error::corrupted(format!(
            "{what} decompresses past the {limit} byte limit"
        )));
    }
    Ok(out)
}

/// Gunzips `bytes` when they carry the gzip magic, otherwise takes them as
/// they are. Invalid UTF-8 is masked byte for byte rather than rejected.
fn inflate_text(bytes: &[u8], limit: u64, what: &str) -> Result<String> {
    let raw = if bytes.starts_with(GZIP_MAGIC) {
        read_bounded(GzDecoder::new(bytes), limit, what)?
    } else {
        read_bounded(bytes, limit, what)?
    };
    Ok(decode_text(raw))
}

fn parse_streams(snapshots: &str, actions: Option<&str>) -> Result<(ParsedSnapshots, MatchedActions)> {
    let parsed = TurnSnapshotReader::new(snapshots).read_all()?;
    let matched = match actions {
        Some(text) => ActionLogReader::new(text)
            .read_matched(&parsed.turns)
            .map_err(|e| e.with_match(parsed.metadata.id))?,
        None => MatchedActions {
            per_turn: vec![Vec::new(); parsed.turns.len()],
            anomalies: Vec::new(),
        },
    };
    Ok((parsed, matched))
}

pub struct LegacyGzipFormat;

impl ReplayFormat for LegacyGzipFormat {
    fn decode(&self, bytes: &[u8], config: &ParserConfig) -> Result<(ParsedSnapshots, MatchedActions)> {
        let text = inflate_text(bytes, config.max_decompressed_bytes, "snapshot stream")?;
        parse_streams(&text, None)
    }
}

pub struct ZipArchiveFormat;

impl ReplayFormat for ZipArchiveFormat {
    fn decode(&self, bytes: &[u8], config: &ParserConfig) -> Result<(ParsedSnapshots, MatchedActions)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| Error::corrupted(format!("zip archive: {e}")))?;

        let mut snapshots = None;
        let mut actions = None;
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .map_err(|e| Error::corrupted(format!("zip entry {index}: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().rsplit('/').next().unwrap_or_default().to_owned();
            let compressed = read_bounded(entry, config.max_decompressed_bytes, &name)?;
            let text = inflate_text(&compressed, config.max_decompressed_bytes, &name)?;
            debug!(entry = %name, bytes = text.len(), "read zip entry");
            if name.starts_with(ACTION_LOG_PREFIX) {
                actions = Some(text);
            } else {
                snapshots = Some(text);
            }
        }

        let snapshots =
            snapshots.ok_or_else(|| Error::corrupted("zip archive has no snapshot stream"))?;
        parse_streams(&snapshots, actions.as_deref())
    }
}

pub struct TreeFormat;

impl ReplayFormat for TreeFormat {
    fn decode(&self, bytes: &[u8], config: &ParserConfig) -> Result<(ParsedSnapshots, MatchedActions)> {
        if bytes.len() as u64 > config.max_decompressed_bytes {
            return Err(Error::corrupted("tree document exceeds the size limit"));
        }
        Ok(TreeReplay::from_slice(bytes)?.into_parts())
    }
}

/// A fully parsed replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayFile {
    pub container: ContainerFormat,
    pub data: ReplayData,
}

impl ReplayFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_config(path, &ParserConfig::default())
    }

    pub fn from_file_with_config(path: &Path, config: &ParserConfig) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, config)
    }

    pub fn from_bytes(bytes: &[u8], config: &ParserConfig) -> Result<Self> {
        let container = ContainerFormat::sniff(bytes)?;
        let span = span!(Level::DEBUG, "replay", container = %container);
        let _enter = span.enter();

        let (snapshots, matched) = container.decoder().decode(bytes, config)?;
        let data = assemble(snapshots, matched, config)?;
        if config.verify_folds {
            verify(&data)?;
        }
        Ok(ReplayFile { container, data })
    }

    /// Parses uncompressed streams directly. Without an action log every
    /// turn has an empty action list.
    pub fn from_streams(
        snapshots: &str,
        actions: Option<&str>,
        config: &ParserConfig,
    ) -> Result<ReplayData> {
        let (snapshots, matched) = parse_streams(snapshots, actions)?;
        let data = assemble(snapshots, matched, config)?;
        if config.verify_folds {
            verify(&data)?;
        }
        Ok(data)
    }

    pub fn controller(&self, constants: Rc<GameConstants>) -> Result<ReplayController> {
        ReplayController::new(self.data.clone(), constants)
    }
}

fn assemble(
    snapshots: ParsedSnapshots,
    mut matched: MatchedActions,
    config: &ParserConfig,
) -> Result<ReplayData> {
    let ParsedSnapshots {
        metadata,
        players,
        turns,
    } = snapshots;
    let match_id = metadata.id;

    if config.repair_turn_order {
        relocate_misplaced_end_turns(&turns, &mut matched.per_turn, &mut matched.anomalies)
            .map_err(|e| e.with_match(match_id))?;
    }

    let registry = ActionRegistry::default();
    let mut built = Vec::with_capacity(turns.len());
    for (index, (snapshot, payloads)) in turns.into_iter().zip(matched.per_turn).enumerate() {
        let actions = registry
            .build_turn(&metadata, &players, &snapshot, &payloads)
            .map_err(|e| e.with_turn(index).with_match(match_id))?;
        built.push(TurnData { snapshot, actions });
    }
    debug!(
        turns = built.len(),
        anomalies = matched.anomalies.len(),
        "replay assembled"
    );

    Ok(ReplayData {
        metadata,
        players,
        turns: built,
        anomalies: matched.anomalies,
    })
}

/// Folds every turn and rejects the replay at the first turn that does not
/// reproduce its successor.
fn verify(data: &ReplayData) -> Result<()> {
    let constants = Rc::new(GameConstants::defaults()?);
    let mut controller = ReplayController::new(data.clone(), constants)?;
    let report = controller.verify_all()?;
    for (turn, mismatches) in &report {
        for mismatch in mismatches {
            warn!(turn, ?mismatch, "fold mismatch");
        }
    }
    match report.into_iter().next() {
        Some((turn, mismatches)) => Err(Error::invariant(
            "folded turn",
            "the next snapshot",
            mismatches,
        )
        .with_turn(turn)
        .with_match(data.metadata.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use crate::ErrorKind;
    use crate::wire::FormatDecoder;

    use super::*;

    #[test]
    fn sniffs_containers() {
        assert_eq!(ContainerFormat::sniff(b"PK\x03\x04rest").unwrap(), ContainerFormat::Zip);
        assert_eq!(ContainerFormat::sniff(&[0x1f, 0x8b, 8]).unwrap(), ContainerFormat::Gzip);
        assert_eq!(ContainerFormat::sniff(b"  {\"formatVersion\":1}").unwrap(), ContainerFormat::Tree);
        let err = ContainerFormat::sniff(b"O:8:").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CorruptedContainer(_)));
    }

    #[test]
    fn inflation_respects_the_limit() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&[b'x'; 64]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate_text(&compressed, 64, "test").unwrap().len(), 64);
        let err = inflate_text(&compressed, 63, "test").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CorruptedContainer(_)));
    }

    #[test]
    fn split_character_in_a_stream_keeps_string_lengths() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"s:4:\"ab\xF0\x9F\";s:2:\"ok\";").unwrap();
        let compressed = encoder.finish().unwrap();

        let text = inflate_text(&compressed, 1024, "test").unwrap();
        assert!(!text.contains('\u{FFFD}'));
        let mut decoder = FormatDecoder::new(&text);
        assert_eq!(decoder.read_string().unwrap(), "ab");
        assert_eq!(decoder.read_string().unwrap(), "ok");
        assert!(decoder.is_at_end());
    }

    #[test]
    fn truncated_gzip_is_corrupted() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"O:8:\"awbwGame\":0:{}").unwrap();
        let mut compressed = encoder.finish().unwrap();
        compressed.truncate(compressed.len() / 2);

        let err = ReplayFile::from_bytes(&compressed, &ParserConfig::default()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CorruptedContainer(_)));
    }

    #[test]
    fn zip_without_snapshots_is_corrupted() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("a1001", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let err = ReplayFile::from_bytes(&bytes, &ParserConfig::default()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CorruptedContainer(_)));
    }
}

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use awbw_replays::{GameConstants, ParserConfig};

/// Tool configuration, loadable from a TOML file.
///
/// Every field has a default. CLI flags override config file values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub parser: ParserConfig,
    /// JSON file whose unit and CO entries replace the built-in tables
    pub constants: Option<PathBuf>,
    /// Indent JSON output
    pub pretty: bool,
}

impl ToolConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("failed to parse config file")?;
        Ok(config)
    }

    /// Built-in tables with the configured overrides merged in.
    pub fn game_constants(&self) -> anyhow::Result<GameConstants> {
        let mut constants = GameConstants::defaults()?;
        if let Some(path) = &self.constants {
            constants
                .apply_overrides(path)
                .with_context(|| format!("failed to load constants from {}", path.display()))?;
        }
        Ok(constants)
    }

    pub fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if matches.is_present("VERIFY") {
            self.parser.verify_folds = true;
        }
        if matches.is_present("NO_REPAIR") {
            self.parser.repair_turn_order = false;
        }
        if matches.is_present("PRETTY") {
            self.pretty = true;
        }
        if let Some(path) = matches.value_of("CONSTANTS") {
            self.constants = Some(PathBuf::from(path));
        }
    }

    /// Generate a commented default TOML config string.
    pub fn generate_default_toml() -> String {
        r#"# AWBW replay tool configuration
# Pass with --config <path>.

# Indent JSON written by `dump` and `state`
pretty = false

# JSON file with "units" and/or "cos" arrays replacing built-in entries
# constants = "tables.json"

[parser]
# Move end-turn actions logged under the next player back to the turn they close
repair_turn_order = true

# Reject replays whose turns do not fold onto the next snapshot
verify_folds = false

# Largest decompressed stream accepted, in bytes
max_decompressed_bytes = 536870912
"#
        .to_string()
    }
}

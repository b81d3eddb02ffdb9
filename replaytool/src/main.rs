mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use awbw_replays::model::{ReplayBuilding, ReplayUnit};
use awbw_replays::replay::controller::{ActivePower, GameOverState, PlayerLedger, TurnCursor};
use awbw_replays::replay::{ReplayControllerState, ReplayPosition};
use awbw_replays::types::PlayerId;
use awbw_replays::{Rc, ReplayFile};

use crate::config::ToolConfig;

const REPLAY_EXTENSIONS: [&str; 3] = ["zip", "gz", "json"];

fn init_tracing(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A single replay, or every replay file below a directory.
fn replay_paths(input: &Path) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| REPLAY_EXTENSIONS.contains(&ext))
        })
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> anyhow::Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

fn parse_index(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<usize>> {
    matches
        .value_of(name)
        .map(|value| {
            value
                .parse::<usize>()
                .with_context(|| format!("invalid {} {value:?}", name.to_lowercase()))
        })
        .transpose()
}

fn load(path: &Path, config: &ToolConfig) -> anyhow::Result<ReplayFile> {
    debug!(path = %path.display(), "parsing replay");
    ReplayFile::from_file_with_config(path, &config.parser)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn summarize(input: &Path, config: &ToolConfig) -> anyhow::Result<()> {
    let mut failures = 0;
    for path in replay_paths(input) {
        match load(&path, config) {
            Ok(replay) => {
                let data = &replay.data;
                println!(
                    "{}: match {} {:?} ({}), {} players, {} turns, {} actions, {} anomalies",
                    path.display(),
                    data.metadata.id,
                    data.metadata.name,
                    replay.container,
                    data.players.len(),
                    data.turns.len(),
                    data.action_count(),
                    data.anomalies.len()
                );
                for anomaly in &data.anomalies {
                    info!(path = %path.display(), ?anomaly, "anomaly");
                }
            }
            Err(e) => {
                warn!("{e:#}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} replays failed to parse");
    }
    Ok(())
}

fn dump(path: &Path, turn: Option<usize>, config: &ToolConfig) -> anyhow::Result<()> {
    let replay = load(path, config)?;
    match turn {
        Some(turn) => {
            let data = replay
                .data
                .turns
                .get(turn)
                .ok_or_else(|| anyhow!("replay has {} turns", replay.data.turns.len()))?;
            print_json(data, config.pretty)
        }
        None => print_json(&replay, config.pretty),
    }
}

/// Board state as seen through the controller.
#[derive(Serialize)]
struct StateView<'a> {
    position: ReplayPosition,
    cursor: TurnCursor,
    ledgers: &'a BTreeMap<PlayerId, PlayerLedger>,
    active_powers: &'a BTreeMap<PlayerId, ActivePower>,
    units: Vec<&'a ReplayUnit>,
    buildings: Vec<&'a ReplayBuilding>,
    game_over: Option<&'a GameOverState>,
}

impl<'a> StateView<'a> {
    fn capture(state: &'a dyn ReplayControllerState) -> Self {
        StateView {
            position: state.position(),
            cursor: state.cursor(),
            ledgers: state.ledgers(),
            active_powers: state.active_powers(),
            units: state.units().values().collect(),
            buildings: state.buildings().values().collect(),
            game_over: state.game_over(),
        }
    }
}

fn show_state(path: &Path, turn: usize, action: Option<usize>, config: &ToolConfig) -> anyhow::Result<()> {
    let replay = load(path, config)?;
    let constants = Rc::new(config.game_constants()?);
    let mut controller = replay.controller(constants)?;
    let action = match action {
        Some(action) => action,
        None => controller
            .actions(turn)
            .map(|actions| actions.len())
            .ok_or_else(|| anyhow!("replay has {} turns", controller.turn_count()))?,
    };
    controller.seek(turn, action)?;
    print_json(&StateView::capture(&controller), config.pretty)
}

fn verify(input: &Path, config: &ToolConfig) -> anyhow::Result<()> {
    let constants = Rc::new(config.game_constants()?);
    let mut drifting = 0;
    for path in replay_paths(input) {
        let replay = load(&path, config)?;
        let mut controller = replay.controller(constants.clone())?;
        let report = controller
            .verify_all()
            .with_context(|| format!("failed to fold {}", path.display()))?;
        if report.is_empty() {
            println!("{}: ok", path.display());
            continue;
        }
        drifting += 1;
        let total: usize = report.values().map(Vec::len).sum();
        println!(
            "{}: {total} mismatches across {} turns",
            path.display(),
            report.len()
        );
        for (turn, mismatches) in &report {
            for mismatch in mismatches {
                println!("  turn {turn}: {mismatch:?}");
            }
        }
    }
    if drifting > 0 {
        bail!("{drifting} replays do not fold onto their snapshots");
    }
    Ok(())
}

fn parser_flags<'a, 'b>(command: App<'a, 'b>) -> App<'a, 'b> {
    command
        .arg(
            Arg::with_name("VERIFY")
                .help("Reject replays whose turns do not fold onto the next snapshot")
                .long("verify-folds"),
        )
        .arg(
            Arg::with_name("NO_REPAIR")
                .help("Keep end-turn actions where the log put them")
                .long("no-repair"),
        )
        .arg(
            Arg::with_name("PRETTY")
                .help("Indent JSON output")
                .long("pretty"),
        )
        .arg(
            Arg::with_name("CONSTANTS")
                .help("JSON file overriding the unit and CO tables")
                .long("constants")
                .takes_value(true),
        )
}

fn replay_arg(help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name("REPLAY").help(help).required(true).index(1)
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("AWBW Replay Tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspects and verifies Advance Wars By Web replays")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("VERBOSE")
                .help("Log more (repeat for debug and trace output)")
                .short("v")
                .multiple(true)
                .global(true),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("TOML configuration file")
                .long("config")
                .takes_value(true)
                .global(true),
        )
        .subcommand(parser_flags(
            SubCommand::with_name("summary")
                .about("Prints one line per replay")
                .arg(replay_arg("A replay file or a directory of them")),
        ))
        .subcommand(parser_flags(
            SubCommand::with_name("dump")
                .about("Writes the parsed replay as JSON")
                .arg(replay_arg("The replay file to dump"))
                .arg(
                    Arg::with_name("TURN")
                        .help("Only dump this turn")
                        .long("turn")
                        .takes_value(true),
                ),
        ))
        .subcommand(parser_flags(
            SubCommand::with_name("state")
                .about("Replays up to a position and writes the board state as JSON")
                .arg(replay_arg("The replay file to step through"))
                .arg(
                    Arg::with_name("TURN")
                        .help("Turn index")
                        .long("turn")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("ACTION")
                        .help("Number of the turn's actions to apply (all when omitted)")
                        .long("action")
                        .takes_value(true),
                ),
        ))
        .subcommand(parser_flags(
            SubCommand::with_name("verify")
                .about("Folds every turn and compares it with the next snapshot")
                .arg(replay_arg("A replay file or a directory of them")),
        ))
        .subcommand(
            SubCommand::with_name("config").about("Prints a commented default configuration"),
        )
        .get_matches();

    let (name, sub) = matches.subcommand();
    let sub = sub.ok_or_else(|| anyhow!("missing subcommand"))?;
    init_tracing(sub.occurrences_of("VERBOSE"));

    if name == "config" {
        print!("{}", ToolConfig::generate_default_toml());
        return Ok(());
    }

    let mut config = match sub.value_of("CONFIG") {
        Some(path) => ToolConfig::load(Path::new(path))?,
        None => ToolConfig::default(),
    };
    config.apply_cli_overrides(sub);
    debug!(?config, "configuration");

    let replay = Path::new(
        sub.value_of("REPLAY")
            .ok_or_else(|| anyhow!("missing replay path"))?,
    );
    match name {
        "summary" => summarize(replay, &config),
        "dump" => dump(replay, parse_index(sub, "TURN")?, &config),
        "state" => {
            let turn = parse_index(sub, "TURN")?.ok_or_else(|| anyhow!("missing --turn"))?;
            show_state(replay, turn, parse_index(sub, "ACTION")?, &config)
        }
        "verify" => verify(replay, &config),
        other => Err(anyhow!("unknown subcommand {other}")),
    }
}

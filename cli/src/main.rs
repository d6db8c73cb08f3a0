//! `converge` - shell command surface over the engine.
//!
//! External handlers call these commands from their `--test` and `--invoke`
//! scripts. Test-style commands exit 0 when the condition holds and 1 when
//! it does not; operational failures exit 2 so scripts can tell "no" from
//! "broken". Mutating commands commit to the shared state database before
//! returning, which is what makes their effects visible to the dispatching
//! process.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use converge_engine::{Engine, EngineConfig, any_file_changed, mark_invoked, was_invoked};
use converge_types::{Direction, Phase};

#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Query and mutate Converge flags from the shell")]
#[command(version)]
struct Cli {
    /// Path to the state database shared with the dispatching process.
    #[arg(
        long,
        env = "CONVERGE_STATE_DB",
        default_value = ".converge/state.db",
        global = true
    )]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set a flag, firing any on-set trigger.
    SetFlag {
        name: String,
        /// Value to store with the flag; parsed as JSON, with plain strings
        /// accepted as-is.
        #[arg(long)]
        value: Option<String>,
    },
    /// Clear a flag, firing any on-clear trigger.
    ClearFlag { name: String },
    /// Set or clear a flag depending on a condition.
    ToggleFlag {
        name: String,
        /// "true" sets the flag, "false" clears it.
        #[arg(action = clap::ArgAction::Set)]
        should_set: bool,
    },
    /// Test whether a flag is set.
    IsFlagSet { name: String },
    /// Test whether every named flag is set.
    AllFlagsSet {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Test whether at least one named flag is set.
    AnyFlagsSet {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print all set flags as a JSON array.
    GetFlags,
    /// Print the JSON value stored with a flag; fails when the flag is unset.
    FlagValue { name: String },
    /// Register a persisted trigger on a flag transition.
    RegisterTrigger {
        flag: String,
        /// Which transition the trigger reacts to.
        #[arg(long, value_enum, default_value_t = On::Set)]
        on: On,
        #[arg(long)]
        set_flag: Option<String>,
        #[arg(long)]
        clear_flag: Option<String>,
    },
    /// Test whether the current hook matches any pattern (hooks phase only).
    Hook {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Test that every named flag is set (convergence phase only).
    WhenAll {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Test that at least one named flag is set (convergence phase only).
    WhenAny {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Test that none of the named flags are set (convergence phase only).
    WhenNone {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Test that not all of the named flags are set (convergence phase only).
    WhenNotAll {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Test whether any of the files changed since the last check.
    WhenFileChanged {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Test that the identified work has not yet run.
    OnlyOnce { id: String },
    /// Durably record that the identified work has run.
    MarkInvoked { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum On {
    Set,
    Clear,
}

impl From<On> for Direction {
    fn from(on: On) -> Self {
        match on {
            On::Set => Direction::OnSet,
            On::Clear => Direction::OnClear,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("converge: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let mut engine = Engine::open(&cli.db, EngineConfig::from_env())
        .with_context(|| format!("Failed to open state db {}", cli.db.display()))?;
    tracing::debug!(db = %cli.db.display(), "opened state db");
    let phase = engine.phase()?;

    match cli.command {
        Command::SetFlag { name, value } => {
            engine.set_flag(&name, value.map(|raw| parse_value(&raw)))?;
            engine.flush()?;
            Ok(true)
        }
        Command::ClearFlag { name } => {
            engine.clear_flag(&name)?;
            engine.flush()?;
            Ok(true)
        }
        Command::ToggleFlag { name, should_set } => {
            engine.toggle_flag(&name, should_set)?;
            engine.flush()?;
            Ok(true)
        }
        Command::IsFlagSet { name } => Ok(engine.is_flag_set(&name)?),
        Command::AllFlagsSet { names } => Ok(engine.all_flags_set(as_strs(&names))?),
        Command::AnyFlagsSet { names } => Ok(engine.any_flags_set(as_strs(&names))?),
        Command::GetFlags => {
            let flags = engine.get_flags()?;
            println!("{}", Value::from(flags));
            Ok(true)
        }
        Command::FlagValue { name } => match engine.flag_value(&name)? {
            Some(value) => {
                println!("{value}");
                Ok(true)
            }
            None => Ok(false),
        },
        Command::RegisterTrigger {
            flag,
            on,
            set_flag,
            clear_flag,
        } => {
            engine.register_trigger(
                &flag,
                on.into(),
                set_flag.as_deref(),
                clear_flag.as_deref(),
                None,
            )?;
            engine.flush()?;
            Ok(true)
        }
        Command::Hook { patterns } => Ok(engine.current_hook_matches(&patterns)?),
        Command::WhenAll { names } => {
            Ok(phase == Phase::Other && engine.all_flags_set(as_strs(&names))?)
        }
        Command::WhenAny { names } => {
            Ok(phase == Phase::Other && engine.any_flags_set(as_strs(&names))?)
        }
        Command::WhenNone { names } => {
            Ok(phase == Phase::Other && !engine.any_flags_set(as_strs(&names))?)
        }
        Command::WhenNotAll { names } => {
            Ok(phase == Phase::Other && !engine.all_flags_set(as_strs(&names))?)
        }
        Command::WhenFileChanged { files } => {
            let changed = any_file_changed(&mut engine, &files)?;
            engine.flush()?;
            Ok(changed)
        }
        Command::OnlyOnce { id } => Ok(!was_invoked(&engine, &id)?),
        Command::MarkInvoked { id } => {
            mark_invoked(&mut engine, &id)?;
            engine.flush()?;
            Ok(true)
        }
    }
}

/// Parse a command-line value as JSON, falling back to a plain string so
/// shell callers can write `--value ready` without quoting JSON.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn as_strs(names: &[String]) -> impl Iterator<Item = &str> {
    names.iter().map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn values_parse_as_json_with_string_fallback() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(parse_value("ready"), json!("ready"));
    }

    #[test]
    fn mutations_commit_to_the_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("state.db");

        let cli = Cli::parse_from([
            "converge",
            "--db",
            db.to_str().unwrap(),
            "set-flag",
            "ready",
            "--value",
            "7",
        ]);
        assert!(run(cli).unwrap());

        let engine = Engine::open(&db, EngineConfig::default()).expect("reopen");
        assert_eq!(engine.flag_value("ready").unwrap(), Some(json!(7)));
    }

    #[test]
    fn test_commands_report_through_the_return_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("state.db");
        let args = |rest: &[&str]| {
            let mut full = vec!["converge", "--db", db.to_str().unwrap()];
            full.extend_from_slice(rest);
            Cli::parse_from(full)
        };

        assert!(!run(args(&["is-flag-set", "ready"])).unwrap());
        assert!(run(args(&["set-flag", "ready"])).unwrap());
        assert!(run(args(&["is-flag-set", "ready"])).unwrap());
        assert!(run(args(&["only-once", "setup"])).unwrap());
        assert!(run(args(&["mark-invoked", "setup"])).unwrap());
        assert!(!run(args(&["only-once", "setup"])).unwrap());
    }

    #[test]
    fn toggle_flag_takes_its_condition_as_a_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("state.db");
        let args = |rest: &[&str]| {
            let mut full = vec!["converge", "--db", db.to_str().unwrap()];
            full.extend_from_slice(rest);
            Cli::parse_from(full)
        };

        assert!(run(args(&["toggle-flag", "ready", "true"])).unwrap());
        assert!(run(args(&["is-flag-set", "ready"])).unwrap());
        assert!(run(args(&["toggle-flag", "ready", "false"])).unwrap());
        assert!(!run(args(&["is-flag-set", "ready"])).unwrap());
    }
}

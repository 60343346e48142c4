use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tally",
    version,
    about = "Tally: tasks, goals, reminders and habits with optimistic sync",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "tallyrc")]
    pub tallyrc: Option<PathBuf>,

    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show one collection (tasks, goals, reminders, habits).
    List { kind: String },
    /// Create an entity from FIELD=VALUE pairs; values are JSON when they parse as JSON.
    Add {
        kind: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    /// Set one field of one entity.
    Update {
        kind: String,
        id: String,
        field: String,
        value: String,
    },
    /// Delete entities after the undo grace period; Ctrl-C during the grace period undoes.
    Delete {
        kind: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List tags.
    Tags,
    /// Add a tag.
    Tag { name: String },
    /// Toggle a habit completion for a day (default today).
    Check {
        id: String,
        #[arg(long)]
        date: Option<String>,
    },
}

fn default_level(verbose: u8, quiet: u8) -> &'static str {
    match (quiet, verbose) {
        (2.., _) => "error",
        (1, _) | (0, 0) => "warn",
        (0, 1) => "info",
        (0, 2) => "debug",
        (0, _) => "trace",
    }
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level(verbose, quiet))
            .map_err(|e| anyhow!("invalid log filter: {e}"))?,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
    if let Err(err) = installed {
        debug!(error = %err, "tracing subscriber already installed");
    }
    Ok(())
}

fn split_rc_override(arg: &str) -> Option<(String, String)> {
    let rest = arg.strip_prefix("rc.")?;
    let at = rest.find(['=', ':'])?;
    let (key, value) = (&rest[..at], &rest[at + 1..]);
    (!key.is_empty()).then(|| (format!("rc.{key}"), value.to_string()))
}

/// Pulls positional `rc.key=value` / `rc.key:value` overrides out of the
/// argument list before clap sees it. The program name is never touched.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned_args = Vec::with_capacity(raw.len());
    let mut rc_overrides = Vec::new();

    for (idx, arg) in raw.iter().enumerate() {
        let captured = if idx == 0 {
            None
        } else {
            arg.to_str().and_then(split_rc_override)
        };
        match captured {
            Some((key, value)) => {
                debug!(%key, %value, "positional rc override");
                rc_overrides.push((key, value));
            }
            None => cleaned_args.push(arg.clone()),
        }
    }

    Ok(PreprocessedArgs {
        cleaned_args,
        rc_overrides,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&os(&[
            "tally",
            "rc.undo.grace_ms=100",
            "delete",
            "rc.undo.enabled:off",
            "task",
            "3",
        ]))
        .expect("preprocess");

        assert_eq!(pre.cleaned_args, os(&["tally", "delete", "task", "3"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.undo.grace_ms".to_string(), "100".to_string()),
                ("rc.undo.enabled".to_string(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn verbosity_levels() {
        assert_eq!(default_level(0, 0), "warn");
        assert_eq!(default_level(2, 0), "debug");
        assert_eq!(default_level(5, 0), "trace");
        assert_eq!(default_level(3, 1), "warn");
        assert_eq!(default_level(0, 2), "error");
        assert_eq!(split_rc_override("rc.=x"), None);
        assert_eq!(split_rc_override("rcfile"), None);
    }

    #[test]
    fn subcommands_parse() {
        let cli = GlobalCli::parse_from(os(&[
            "tally",
            "-vv",
            "--rc",
            "undo.grace_ms=10",
            "add",
            "task",
            "text=BUY MILK",
            "date=2025-03-01",
        ]));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.rc_overrides[0].key, "undo.grace_ms");
        match cli.command {
            Command::Add { kind, fields } => {
                assert_eq!(kind, "task");
                assert_eq!(fields, vec!["text=BUY MILK", "date=2025-03-01"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

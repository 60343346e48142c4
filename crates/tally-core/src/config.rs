use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use tracing::{debug, info, trace, warn};

const RC_ENV: &str = "TALLYRC";
const RC_FILE: &str = ".tallyrc";
const DATA_DIR: &str = ".tally";

const DEFAULTS: &[(&str, &str)] = &[
    ("data.location", "~/.tally"),
    ("undo.enabled", "on"),
    ("undo.grace_ms", "4500"),
    ("signals.capacity", "64"),
];

#[derive(Debug, Clone)]
pub struct Config {
    values: HashMap<String, String>,
    pub loaded_files: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: DEFAULTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            loaded_files: vec![],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RcLine<'a> {
    Include(&'a str),
    Set(&'a str, &'a str),
}

fn parse_rc_line(raw: &str) -> anyhow::Result<Option<RcLine<'_>>> {
    let line = raw.split_once('#').map_or(raw, |(before, _)| before).trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(target) = line.strip_prefix("include ") {
        let target = target.trim();
        if target.is_empty() {
            bail!("include needs a path");
        }
        return Ok(Some(RcLine::Include(target)));
    }
    match line.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok(Some(RcLine::Set(key.trim(), value.trim())))
        }
        _ => bail!("expected key = value"),
    }
}

impl Config {
    /// Defaults, then the rc file picked by `--tallyrc`, `$TALLYRC` or
    /// `~/.tallyrc` (first one set wins; `TALLYRC=/dev/null` skips it).
    #[tracing::instrument(skip(explicit))]
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        match locate_rc(explicit)? {
            Some(path) => {
                info!(rc = %path.display(), "reading rc file");
                cfg.read_file(&path)?;
            }
            None => debug!("no rc file; defaults only"),
        }
        Ok(cfg)
    }

    pub fn apply_overrides<I>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in overrides {
            let key = key.strip_prefix("rc.").map(str::to_string).unwrap_or(key);
            debug!(%key, %value, "rc override");
            self.values.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).map(|v| parse_bool(v))
    }

    /// Numeric value of `key`; an unparsable value is an error, not a default.
    pub fn get_u64(&self, key: &str) -> anyhow::Result<Option<u64>> {
        let Some(raw) = self.values.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("config key {key} expects a number, got {raw:?}"))
    }

    fn read_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let path = expand_tilde(path);
        if self.loaded_files.contains(&path) {
            warn!(rc = %path.display(), "rc file already read; include cycle skipped");
            return Ok(());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.loaded_files.push(path.clone());
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();

        for (idx, raw) in text.lines().enumerate() {
            let parsed = parse_rc_line(raw)
                .with_context(|| format!("invalid config line {}:{}", path.display(), idx + 1))?;
            match parsed {
                None => {}
                Some(RcLine::Set(key, value)) => {
                    trace!(key, value, "rc value");
                    self.values.insert(key.to_string(), value.to_string());
                }
                Some(RcLine::Include(target)) => {
                    let target = expand_tilde(Path::new(target));
                    let target = if target.is_absolute() {
                        target
                    } else {
                        base.join(target)
                    };
                    if target.exists() {
                        self.read_file(&target)?;
                    } else {
                        warn!(include = %target.display(), "included rc file missing; skipped");
                    }
                }
            }
        }
        Ok(())
    }
}

fn home() -> anyhow::Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))
}

fn locate_rc(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        return Ok(Some(path.to_path_buf()));
    }
    if let Some(from_env) = std::env::var_os(RC_ENV) {
        return Ok((from_env != "/dev/null").then(|| PathBuf::from(from_env)));
    }
    let candidate = home()?.join(RC_FILE);
    Ok(candidate.exists().then_some(candidate))
}

#[tracing::instrument(skip(cfg))]
pub fn resolve_data_dir(cfg: &Config, explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = match (explicit, cfg.get("data.location")) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(location)) => expand_tilde(Path::new(&location)),
        (None, None) => home()?.join(DATA_DIR),
    };

    if !dir.is_dir() {
        info!(dir = %dir.display(), "creating data directory");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "on" | "true"
    )
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn rc_lines() {
        assert_eq!(parse_rc_line("  # only a comment").expect("parse"), None);
        assert_eq!(
            parse_rc_line("undo.grace_ms = 6000 # ms").expect("parse"),
            Some(RcLine::Set("undo.grace_ms", "6000"))
        );
        assert_eq!(
            parse_rc_line("include extra.rc").expect("parse"),
            Some(RcLine::Include("extra.rc"))
        );
        assert!(parse_rc_line("= value").is_err());
        assert!(parse_rc_line("just words").is_err());
    }

    #[test]
    fn rc_file_with_include_and_overrides() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("extra.rc"), "signals.capacity = 8\n").expect("write include");
        let rc = temp.path().join("tallyrc");
        fs::write(
            &rc,
            "# grace for slow thumbs\n\
             undo.grace_ms=6000 # ms\n\
             include extra.rc\n\
             include missing.rc\n",
        )
        .expect("write rc");

        let mut cfg = Config::load(Some(&rc)).expect("load config");
        assert_eq!(cfg.get_u64("undo.grace_ms").expect("numeric"), Some(6000));
        assert_eq!(cfg.get("signals.capacity").as_deref(), Some("8"));
        assert_eq!(cfg.get("data.location").as_deref(), Some("~/.tally"));
        assert_eq!(cfg.loaded_files.len(), 2);

        cfg.apply_overrides(vec![("rc.undo.enabled".to_string(), "off".to_string())]);
        assert_eq!(cfg.get_bool("undo.enabled"), Some(false));
    }

    #[test]
    fn self_include_is_read_once() {
        let temp = tempdir().expect("tempdir");
        let rc = temp.path().join("tallyrc");
        fs::write(&rc, "include tallyrc\nundo.enabled = yes\n").expect("write rc");

        let cfg = Config::load(Some(&rc)).expect("load config");
        assert_eq!(cfg.loaded_files.len(), 1);
        assert_eq!(cfg.get_bool("undo.enabled"), Some(true));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let rc = temp.path().join("tallyrc");
        fs::write(&rc, "just words\n").expect("write rc");

        let err = Config::load(Some(&rc)).expect_err("malformed rc");
        assert!(err.to_string().contains("invalid config line"));
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let mut cfg = Config::default();
        cfg.apply_overrides(vec![("undo.grace_ms".to_string(), "soon".to_string())]);
        assert!(cfg.get_u64("undo.grace_ms").is_err());
    }

    #[test]
    fn explicit_data_dir_is_created() {
        let temp = tempdir().expect("tempdir");
        let wanted = temp.path().join("nested").join("data");
        let dir = resolve_data_dir(&Config::default(), Some(&wanted)).expect("data dir");
        assert_eq!(dir, wanted);
        assert!(wanted.is_dir());
    }
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;

use crate::metadata::DEFAULT_MAX_HEIGHT;
use crate::tools::Toolchain;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_SUBDIR: &str = "chapters";

/// What to do when a single segment cannot be cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentFailurePolicy {
    /// Keep cutting the remaining segments and report failures at the end.
    #[default]
    Continue,
    /// End the run at the first failed segment.
    Abort,
}

impl FromStr for SegmentFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected `continue` or `abort`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub work_dir: PathBuf,
    pub output_subdir: PathBuf,
    pub max_height: u32,
    pub toolchain: Toolchain,
    pub on_segment_failure: SegmentFailurePolicy,
    pub reuse_metadata: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            output_subdir: PathBuf::from(DEFAULT_OUTPUT_SUBDIR),
            max_height: DEFAULT_MAX_HEIGHT,
            toolchain: Toolchain::default(),
            on_segment_failure: SegmentFailurePolicy::default(),
            reuse_metadata: true,
        }
    }
}

impl Settings {
    /// Directory the per-chapter files are written into.
    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join(&self.output_subdir)
    }
}

/// Values given explicitly on the command line. They win over the
/// environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub work_dir: Option<PathBuf>,
    pub output_subdir: Option<PathBuf>,
    pub max_height: Option<u32>,
    pub yt_dlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub on_segment_failure: Option<SegmentFailurePolicy>,
    pub reuse_metadata: Option<bool>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(SettingsOverrides::default())
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let defaults = Settings::default();
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let work_dir = non_blank_path(overrides.work_dir)
        .or_else(|| lookup("AUTOSPLIT_WORK_DIR").map(PathBuf::from))
        .unwrap_or(defaults.work_dir);
    let output_subdir = non_blank_path(overrides.output_subdir)
        .or_else(|| lookup("AUTOSPLIT_OUTPUT_SUBDIR").map(PathBuf::from))
        .unwrap_or(defaults.output_subdir);
    let max_height = overrides
        .max_height
        .filter(|height| *height > 0)
        .or_else(|| {
            parse_or_warn::<u32>("AUTOSPLIT_MAX_HEIGHT", lookup("AUTOSPLIT_MAX_HEIGHT"))
                .filter(|height| *height > 0)
        })
        .unwrap_or(defaults.max_height);
    let yt_dlp = non_blank_path(overrides.yt_dlp)
        .or_else(|| lookup("AUTOSPLIT_YT_DLP").map(PathBuf::from))
        .unwrap_or(defaults.toolchain.yt_dlp);
    let ffmpeg = non_blank_path(overrides.ffmpeg)
        .or_else(|| lookup("AUTOSPLIT_FFMPEG").map(PathBuf::from))
        .unwrap_or(defaults.toolchain.ffmpeg);
    let on_segment_failure = overrides
        .on_segment_failure
        .or_else(|| {
            parse_or_warn(
                "AUTOSPLIT_ON_SEGMENT_FAILURE",
                lookup("AUTOSPLIT_ON_SEGMENT_FAILURE"),
            )
        })
        .unwrap_or(defaults.on_segment_failure);
    let reuse_metadata = overrides
        .reuse_metadata
        .or_else(|| {
            lookup("AUTOSPLIT_REUSE_METADATA")
                .and_then(|value| parse_flag("AUTOSPLIT_REUSE_METADATA", &value))
        })
        .unwrap_or(defaults.reuse_metadata);

    Settings {
        work_dir,
        output_subdir,
        max_height,
        toolchain: Toolchain { yt_dlp, ffmpeg },
        on_segment_failure,
        reuse_metadata,
    }
}

fn non_blank_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|path| !path.as_os_str().to_string_lossy().trim().is_empty())
}

fn parse_or_warn<T>(key: &str, raw: Option<String>) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring invalid setting");
            None
        }
    }
}

fn parse_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "ignoring invalid boolean setting");
            None
        }
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> Settings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_without_configuration() {
        let settings = build_settings(&HashMap::new(), |_| None);
        assert_eq!(settings.work_dir, PathBuf::from("."));
        assert_eq!(settings.output_dir(), PathBuf::from("./chapters"));
        assert_eq!(settings.max_height, 1080);
        assert_eq!(settings.toolchain, Toolchain::default());
        assert_eq!(settings.on_segment_failure, SegmentFailurePolicy::Continue);
        assert!(settings.reuse_metadata);
    }

    #[test]
    fn env_file_values_are_read() {
        let settings = settings_from(
            "AUTOSPLIT_WORK_DIR=\"/videos\"\nAUTOSPLIT_OUTPUT_SUBDIR=parts\nAUTOSPLIT_MAX_HEIGHT=720\nAUTOSPLIT_ON_SEGMENT_FAILURE=abort\nAUTOSPLIT_REUSE_METADATA=no\n",
        );
        assert_eq!(settings.output_dir(), PathBuf::from("/videos/parts"));
        assert_eq!(settings.max_height, 720);
        assert_eq!(settings.on_segment_failure, SegmentFailurePolicy::Abort);
        assert!(!settings.reuse_metadata);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("AUTOSPLIT_FFMPEG=\"/file/ffmpeg\"\n").path())
            .unwrap();
        let settings = build_settings(&vars, |key| {
            (key == "AUTOSPLIT_FFMPEG").then(|| "/env/ffmpeg".to_string())
        });
        assert_eq!(settings.toolchain.ffmpeg, PathBuf::from("/env/ffmpeg"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export AUTOSPLIT_WORK_DIR="/media"
            AUTOSPLIT_YT_DLP='/opt/yt-dlp'
            AUTOSPLIT_MAX_HEIGHT =  "480"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("AUTOSPLIT_WORK_DIR").unwrap(), "/media");
        assert_eq!(vars.get("AUTOSPLIT_YT_DLP").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("AUTOSPLIT_MAX_HEIGHT").unwrap(), "480");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("AUTOSPLIT_WORK_DIR".to_string(), "/file-work".to_string());
        vars.insert("AUTOSPLIT_OUTPUT_SUBDIR".to_string(), "file-out".to_string());
        vars.insert("AUTOSPLIT_MAX_HEIGHT".to_string(), "360".to_string());

        let overrides = SettingsOverrides {
            work_dir: Some(PathBuf::from("/cli-work")),
            max_height: Some(1440),
            on_segment_failure: Some(SegmentFailurePolicy::Abort),
            ..SettingsOverrides::default()
        };
        let settings = build_settings_with_overrides(
            &vars,
            |key| match key {
                "AUTOSPLIT_OUTPUT_SUBDIR" => Some("env-out".to_string()),
                "AUTOSPLIT_ON_SEGMENT_FAILURE" => Some("continue".to_string()),
                _ => None,
            },
            overrides,
        );

        assert_eq!(settings.work_dir, PathBuf::from("/cli-work"));
        assert_eq!(settings.output_subdir, PathBuf::from("env-out"));
        assert_eq!(settings.max_height, 1440);
        assert_eq!(settings.on_segment_failure, SegmentFailurePolicy::Abort);
    }

    #[test]
    fn blank_values_are_unset() {
        let vars = read_env_file(make_config("AUTOSPLIT_OUTPUT_SUBDIR=\"  \"\n").path()).unwrap();
        let settings = build_settings_with_overrides(
            &vars,
            |_| None,
            SettingsOverrides {
                work_dir: Some(PathBuf::from("   ")),
                ..SettingsOverrides::default()
            },
        );
        assert_eq!(settings.work_dir, PathBuf::from("."));
        assert_eq!(settings.output_subdir, PathBuf::from(DEFAULT_OUTPUT_SUBDIR));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let settings = settings_from(
            "AUTOSPLIT_MAX_HEIGHT=\"tall\"\nAUTOSPLIT_ON_SEGMENT_FAILURE=retry\nAUTOSPLIT_REUSE_METADATA=maybe\n",
        );
        assert_eq!(settings.max_height, DEFAULT_MAX_HEIGHT);
        assert_eq!(settings.on_segment_failure, SegmentFailurePolicy::Continue);
        assert!(settings.reuse_metadata);

        let settings = settings_from("AUTOSPLIT_MAX_HEIGHT=0\n");
        assert_eq!(settings.max_height, DEFAULT_MAX_HEIGHT);
    }

    #[test]
    fn failure_policy_parses_case_insensitively() {
        assert_eq!(
            " ABORT ".parse::<SegmentFailurePolicy>().unwrap(),
            SegmentFailurePolicy::Abort
        );
        assert!("skip".parse::<SegmentFailurePolicy>().is_err());
    }
}

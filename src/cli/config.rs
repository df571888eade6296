use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tokio::fs;
use tracing::info;

use crate::cli::context::CliContext;
use crate::config::{default_config_path, BugtrailConfig};
use crate::output::{render, OutputFormat};

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Clone, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration (defaults, file and environment merged)
    Show,

    /// Get one value by dotted key, e.g. hub.heartbeat_interval_ms
    Get {
        /// Configuration key
        key: String,
    },

    /// Set one value in the configuration file
    Set {
        /// Configuration key
        key: String,

        /// Value; parsed as JSON when possible, otherwise taken as a string
        value: String,
    },

    /// Print the built-in defaults
    Defaults,

    /// Validate the effective configuration
    Validate,
}

pub async fn cmd_config(args: ConfigArgs, ctx: &CliContext) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            match ctx.config_path() {
                Some(path) => eprintln!("# configuration from {}", path.display()),
                None => eprintln!("# no configuration file; defaults and environment"),
            }
            println!("{}", dump(ctx.config(), ctx.output())?);
        }
        ConfigAction::Get { key } => {
            let json = serde_json::to_value(ctx.config())?;
            let segments = split_key(&key)?;
            match get_json_value(&json, &segments) {
                Some(JsonValue::String(text)) => println!("{text}"),
                Some(value) => println!("{}", dump(value, ctx.output())?.trim_end()),
                None => bail!("{} not found in configuration", key),
            }
        }
        ConfigAction::Set { key, value } => {
            let path = target_path(ctx)?;
            let mut doc = load_document(&path).await?;
            let segments = split_key(&key)?;
            set_json_value(&mut doc, &segments, parse_cli_value(&value))?;

            // The edited file must still describe a valid configuration.
            let mut merged = serde_json::to_value(ctx.config())?;
            merge(&mut merged, &doc);
            let candidate: BugtrailConfig = serde_json::from_value(merged)
                .with_context(|| format!("{key} does not accept {value}"))?;
            candidate.validate()?;

            save_document(&path, &doc).await?;
            info!(key = %key, path = %path.display(), "configuration updated");
            println!("Saved {} to {}", key, path.display());
        }
        ConfigAction::Defaults => {
            println!("{}", dump(&BugtrailConfig::default(), ctx.output())?);
        }
        ConfigAction::Validate => {
            ctx.config().validate()?;
            match ctx.config_path() {
                Some(path) => println!("Configuration file {} is valid", path.display()),
                None => println!("No configuration file; defaults and environment are valid"),
            }
        }
    }

    Ok(())
}

fn dump<T: Serialize>(value: &T, format: OutputFormat) -> Result<String> {
    let format = match format {
        OutputFormat::Json => OutputFormat::Json,
        _ => OutputFormat::Yaml,
    };
    Ok(render(value, format, |_| String::new())?)
}

fn target_path(ctx: &CliContext) -> Result<PathBuf> {
    ctx.config_path()
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .ok_or_else(|| anyhow!("no configuration directory; pass --config"))
}

async fn load_document(path: &Path) -> Result<JsonValue> {
    if !fs::try_exists(path).await? {
        return Ok(JsonValue::Object(Map::new()));
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let doc: Option<JsonValue> = if is_json(path) {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(doc.unwrap_or_else(|| JsonValue::Object(Map::new())))
}

async fn save_document(path: &Path, doc: &JsonValue) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let serialized = if is_json(path) {
        serde_json::to_string_pretty(doc)?
    } else {
        serde_yaml::to_string(doc)?
    };
    fs::write(path, serialized)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn parse_cli_value(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

fn split_key(key: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key
        .split('.')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.is_empty() {
        bail!("configuration key cannot be empty");
    }
    Ok(segments)
}

fn set_json_value(target: &mut JsonValue, path: &[&str], value: JsonValue) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        bail!("configuration key cannot be empty");
    };
    let mut current = target;
    for segment in parents {
        current = ensure_object(current, segment)?
            .entry((*segment).to_string())
            .or_insert(JsonValue::Null);
    }
    ensure_object(current, last)?.insert((*last).to_string(), value);
    Ok(())
}

fn ensure_object<'a>(
    value: &'a mut JsonValue,
    segment: &str,
) -> Result<&'a mut Map<String, JsonValue>> {
    if value.is_null() {
        *value = JsonValue::Object(Map::new());
    }
    match value {
        JsonValue::Object(map) => Ok(map),
        _ => bail!(
            "{} resolves to a non-object value; cannot assign nested configuration",
            segment
        ),
    }
}

fn get_json_value<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for segment in path {
        match current {
            JsonValue::Object(map) => {
                current = map.get(*segment)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Overlays `patch` onto `base`, recursing into objects.
fn merge(base: &mut JsonValue, patch: &JsonValue) {
    match (base, patch) {
        (JsonValue::Object(base), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory under the base path that holds the layer files.
const CONFIGURATION_DIR: &str = "configuration";

/// Extensions tried, in order, for each layer file.
const LAYER_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Environment variables overriding file values start with this prefix, as in
/// `APP_ROUTING__INTERVAL_MS`.
const OVERRIDE_PREFIX: &str = "APP";

const OVERRIDE_PREFIX_SEPARATOR: &str = "_";

const OVERRIDE_KEY_SEPARATOR: &str = "__";

const OVERRIDE_LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures.
pub trait Config {
    /// Keys whose override values are split on commas.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// File layer of the engine configuration. Later layers win.
#[derive(Debug, Clone, Copy)]
enum Layer {
    /// Settings shared by every environment.
    Base,
    /// Settings of the environment selected by `APP_ENVIRONMENT`.
    Environment(Environment),
}

impl Layer {
    fn file_stem(self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment(environment) => environment.as_str(),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Base => f.write_str("base layer"),
            Layer::Environment(environment) => write!(f, "`{environment}` layer"),
        }
    }
}

/// Why the engine configuration could not be loaded.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("no file for the {layer} in `{directory}`, looked for {searched}")]
    LayerMissing {
        layer: String,
        directory: PathBuf,
        searched: String,
    },

    #[error("the {layer} at `{path}` is unreadable: {source}")]
    LayerUnreadable {
        layer: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to merge configuration overrides: {0}")]
    Overrides(#[source] rust_cli_config::ConfigError),

    #[error("configuration does not match the expected shape: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads configuration from `configuration/` under the current working directory.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    load_config_from(&base_path)
}

/// Loads configuration from `base_path/configuration`.
///
/// The base layer is read first, then the layer named after the runtime environment, then
/// `APP_`-prefixed environment variables with `__` between nested keys. Both layer files
/// must exist, in any of the supported formats.
pub fn load_config_from<T>(base_path: &Path) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = base_path.join(CONFIGURATION_DIR);
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }

    let environment = Environment::load()?;

    let mut builder = rust_cli_config::Config::builder();
    for layer in [Layer::Base, Layer::Environment(environment)] {
        builder = add_layer(builder, &directory, layer)?;
    }

    builder
        .add_source(overrides::<T>())
        .build()
        .map_err(LoadConfigError::Overrides)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Adds the file of `layer`, building once so a syntax error names the offending file.
fn add_layer(
    builder: ConfigBuilder<DefaultState>,
    directory: &Path,
    layer: Layer,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    let path = layer_file(directory, layer)?;
    let builder = builder.add_source(rust_cli_config::File::from(path.clone()));

    if let Err(source) = builder.clone().build() {
        return Err(LoadConfigError::LayerUnreadable {
            layer: layer.to_string(),
            path,
            source,
        });
    }

    Ok(builder)
}

fn layer_file(directory: &Path, layer: Layer) -> Result<PathBuf, LoadConfigError> {
    let candidates: Vec<PathBuf> = LAYER_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{}.{extension}", layer.file_stem())))
        .collect();

    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }

    Err(LoadConfigError::LayerMissing {
        layer: layer.to_string(),
        directory: directory.to_path_buf(),
        searched: candidates
            .iter()
            .map(|path| format!("`{}`", path.display()))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn overrides<T: Config>() -> rust_cli_config::Environment {
    let source = rust_cli_config::Environment::with_prefix(OVERRIDE_PREFIX)
        .prefix_separator(OVERRIDE_PREFIX_SEPARATOR)
        .separator(OVERRIDE_KEY_SEPARATOR);

    if T::LIST_PARSE_KEYS.is_empty() {
        return source;
    }

    T::LIST_PARSE_KEYS.iter().fold(
        source
            .try_parsing(true)
            .list_separator(OVERRIDE_LIST_SEPARATOR),
        |source, key| source.with_list_parse_key(key),
    )
}

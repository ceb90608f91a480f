use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use figment_file_provider_adapter::FileAdapter;
use platform_dirs::AppDirs;
use serde::{Deserialize, Serialize};

pub(crate) mod duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrometheusConfig {
    pub address: String,
    pub port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9080,
        }
    }
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// How the entry file of a deployment is executed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogicConfig {
    pub entry: String,
    /// Program (plus leading arguments) the entry file is handed to. Empty runs it directly.
    pub interpreter: Vec<String>,
    #[serde(with = "crate::config::duration", default = "default_timeout")]
    pub timeout: Duration,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            entry: "index.js".to_string(),
            interpreter: vec!["node".to_string()],
            timeout: default_timeout(),
        }
    }
}

/// Collaborator handles passed through to deployed logic on every invocation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContextConfig {
    pub chat_token: Option<String>,
    pub database_url: Option<String>,
    pub credentials_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Configuration {
    pub storage: PathBuf,
    pub address: String,
    pub port: u16,
    pub deploy_token: Option<String>,
    pub body_limit: usize,
    pub logic: LogicConfig,
    pub context: ContextConfig,
    pub prometheus: PrometheusConfig,
}

impl Configuration {
    pub fn figment(configs: Vec<PathBuf>) -> Figment {
        let fig = Figment::from(Serialized::defaults(Configuration::default()));

        let fig = match AppDirs::new(Some("hotdeploy"), true) {
            Some(app_dirs) => {
                let config_path = app_dirs.config_dir.join("config.yaml");
                match config_path.exists() {
                    true => fig.merge(
                        FileAdapter::wrap(Yaml::file(config_path)).with_suffix("_file"),
                    ),
                    false => fig,
                }
            }
            None => fig,
        };

        let fig = configs.into_iter().fold(fig, |fig, config_path| {
            fig.merge(FileAdapter::wrap(Yaml::file(config_path)).with_suffix("_file"))
        });

        fig.merge(
            FileAdapter::wrap(Env::prefixed("HOTDEPLOY_").split("__")).with_suffix("_file"),
        )
    }

    pub fn config(figment: Figment) -> Result<Configuration> {
        let config: Configuration = figment.extract().context("Failed to load configuration")?;

        if config.port == 0 {
            bail!("port must be set to a non-zero value");
        }

        if config.logic.entry.is_empty() {
            bail!("logic.entry must name the entry file of a deployment");
        }

        if config.deploy_token.is_none() {
            tracing::warn!("No deploy_token configured, all deploy requests will be refused");
        }

        Ok(config)
    }

    pub fn blobs_path(&self) -> PathBuf {
        self.storage.join("blobs")
    }

    pub fn deployments_path(&self) -> PathBuf {
        self.storage.join("deployments")
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.storage.join("uploads")
    }

    pub fn process_state_path(&self) -> PathBuf {
        self.storage.join("process_state")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            storage: PathBuf::from(".data"),
            address: "0.0.0.0".to_string(),
            port: 3000,
            deploy_token: None,
            body_limit: 10 * 1048576,
            logic: LogicConfig::default(),
            context: ContextConfig::default(),
            prometheus: PrometheusConfig::default(),
        }
    }
}

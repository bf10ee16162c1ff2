use crate::config::PalisadeConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration by merging the TOML file at `path` with
    /// `PALISADE_`-prefixed environment variables (env wins).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load(path: &str) -> Result<PalisadeConfig> {
        let config: PalisadeConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PALISADE_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {path}"))?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        Ok(config)
    }

    /// Loads configuration with a profile overlay
    /// (`Palisade.toml` then `Palisade.<profile>.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(path: &str, profile: &str) -> Result<PalisadeConfig> {
        let overlay = profile_path(path, profile);
        let config: PalisadeConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Toml::file(&overlay))
            .merge(Env::prefixed("PALISADE_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {path} + {overlay}"))?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        Ok(config)
    }
}

fn profile_path(path: &str, profile: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{profile}.{ext}"),
        None => format!("{path}.{profile}"),
    }
}

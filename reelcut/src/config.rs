use anyhow::{Context, Result, bail};
use derivative::Derivative;
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Defaults for every command, read from a TOML file. Command line flags win over these.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct Settings {
    #[derivative(Default(value = "29.97"))]
    pub fps: f64,

    #[derivative(Default(value = "48000"))]
    pub sample_rate: u32,

    pub chronological: bool,

    pub close_clips: bool,

    pub encode: EncodeSettings,

    pub splice: SpliceSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct EncodeSettings {
    #[derivative(Default(value = "\"auto\".to_string()"))]
    pub video_codec: String,

    /// Absent means the encoder picks
    pub video_bit_rate: Option<usize>,

    #[derivative(Default(value = "\"auto\".to_string()"))]
    pub audio_codec: String,

    pub audio_bit_rate: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[serde(default)]
pub struct SpliceSettings {
    /// Output length in frames
    #[derivative(Default(value = "300"))]
    pub duration: i64,

    #[derivative(Default(value = "80"))]
    pub cut_len_avg: i64,

    #[derivative(Default(value = "40"))]
    pub cut_len_var: i64,

    pub seed: Option<u64>,
}

impl Settings {
    /// Read settings from `path`.
    ///
    /// A missing file is created with the defaults. A file that does not parse is kept as
    /// `<path>.bak` and replaced by the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no settings at {}, writing defaults", path.display());
                let settings = Self::default();
                settings.save(path)?;
                return Ok(settings);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read settings {} failed", path.display()));
            }
        };

        match toml::from_str::<Settings>(&text) {
            Ok(settings) => {
                settings.validate()?;
                log::debug!("loaded settings from {}", path.display());
                Ok(settings)
            }
            Err(e) => {
                log::warn!("parse settings {} failed: {e}", path.display());

                let mut backup = path.as_os_str().to_owned();
                backup.push(".bak");
                _ = fs::copy(path, &backup);

                let settings = Self::default();
                settings.save(path)?;
                Ok(settings)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        match toml::to_string_pretty(self) {
            Ok(text) => Ok(fs::write(path, text)
                .with_context(|| format!("save settings {} failed", path.display()))?),
            Err(e) => bail!("convert settings to toml format failed. {e:?}"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            bail!("fps must be positive, got {}", self.fps);
        }
        if self.sample_rate == 0 {
            bail!("sample rate must be positive");
        }
        Ok(())
    }
}

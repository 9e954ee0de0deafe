use gambit_core::{ColorCorrection, GameBoy};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmulationMode {
    #[default]
    Auto,
    ForceDmg,
    ForceCgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorrectionSetting {
    #[default]
    Off,
    Fast,
    Accurate,
}

impl From<CorrectionSetting> for ColorCorrection {
    fn from(value: CorrectionSetting) -> Self {
        match value {
            CorrectionSetting::Off => Self::Off,
            CorrectionSetting::Fast => Self::Fast,
            CorrectionSetting::Accurate => Self::Accurate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CliConfig {
    pub emulation_mode: EmulationMode,
    pub color_correction: CorrectionSetting,
    /// Four 0xRRGGBB shades, lightest first, used for BG and both OBJ
    /// palettes.
    pub dmg_palette: Option<[u32; 4]>,
    pub frames: Option<usize>,
    pub battery_dir: Option<PathBuf>,
}

impl CliConfig {
    pub fn apply(&self, gb: &mut GameBoy) {
        gb.set_color_correction_mode(self.color_correction.into());
        if let Some(shades) = self.dmg_palette {
            for palette in 0..3 {
                for (color, &rgb) in shades.iter().enumerate() {
                    gb.set_dmg_palette_color(palette, color, rgb);
                }
            }
        }
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("gambit").join("gambit.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gambit").join("gambit.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("gambit")
            .join("gambit.toml");
    }

    PathBuf::from("gambit.toml")
}

pub fn load_from_file(path: &Path) -> CliConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CliConfig::default(),
    };

    match toml::from_str::<CliConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            CliConfig::default()
        }
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ── Quality ───────────────────────────────────────────────────────────────────

/// Encoder quality preset. Backends receive the mapped float.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    /// Map to the 0..1 quality factor the encoder interface takes.
    pub fn factor(self) -> f32 {
        match self {
            Self::UltraLow => 0.25,
            Self::Low => 0.5,
            Self::Medium => 0.75,
            Self::High => 1.0,
        }
    }
}

// ── StreamSettings ────────────────────────────────────────────────────────────

/// User-facing streaming settings. The binaries persist this as JSON under
/// the per-user config directory; the core pipelines take plain values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub port:         u16,
    pub width:        u32,
    pub height:       u32,
    pub fps:          u32,
    pub bitrate_mbps: u32,
    pub quality:      Quality,
    pub gaming_boost: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            port:         8888,
            width:        1920,
            height:       1200,
            fps:          60,
            bitrate_mbps: 20,
            quality:      Quality::Medium,
            gaming_boost: false,
        }
    }
}

impl StreamSettings {
    /// Interval between frames at the configured rate, nanoseconds.
    pub fn frame_interval_ns(&self) -> u64 {
        1_000_000_000 / self.fps.max(1) as u64
    }

    /// `~/.config/sidecast/settings.json` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sidecast").join("settings.json"))
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: StreamSettings =
            serde_json::from_str(r#"{"port": 9000, "quality": "high"}"#).expect("partial json");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.quality, Quality::High);
        assert_eq!(settings.fps, 60);
        assert_eq!(settings.width, 1920);
    }

    #[test]
    fn quality_factors_are_ordered() {
        assert!(Quality::UltraLow.factor() < Quality::Low.factor());
        assert!(Quality::Low.factor() < Quality::Medium.factor());
        assert!(Quality::Medium.factor() < Quality::High.factor());
    }

    #[test]
    fn frame_interval_at_60fps() {
        let settings = StreamSettings::default();
        assert_eq!(settings.frame_interval_ns(), 16_666_666);
    }

    #[test]
    fn settings_json_roundtrip() {
        let mut settings = StreamSettings::default();
        settings.bitrate_mbps = 50;
        settings.gaming_boost = true;
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: StreamSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }
}

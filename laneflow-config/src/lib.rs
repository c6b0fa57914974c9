//! Configuration document for one camera pipeline.
//!
//! The on-disk format is JSON. Unknown keys are ignored and every recognized
//! key has a documented default, so a partial document is always valid. A
//! rotating `<path>.backup` copy is written after every successful load and
//! is the first fallback when the main file fails to parse; defaults are the
//! last resort. Saving goes through a temporary file in the same directory
//! followed by an atomic rename, so a crash mid-write cannot corrupt the
//! settings.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use laneflow_types::{LineConfig, QueueConfig, RoiCrop, ZoneDirections, ZonesConfig};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("temp file persist error: {source}")]
    Persist {
        #[from]
        source: tempfile::PersistError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_confidence_min() -> f32 {
    0.5
}
fn default_model() -> String {
    "yolo11n.pt".to_string()
}
fn default_tracker() -> String {
    "bytetrack.yaml".to_string()
}
fn default_counting_mode() -> CountingMode {
    CountingMode::Line
}
fn default_zone_event_cooldown() -> f64 {
    0.8
}
fn default_report_interval_min() -> u32 {
    15
}
fn default_rtsp_buffer_size() -> usize {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountingMode {
    #[serde(rename = "line")]
    Line,
    #[serde(rename = "zone")]
    Zone,
}

/// The full per-camera configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Primary stream URL.
    #[serde(default)]
    pub rtsp_url: String,
    /// Optional second stream for a queue-only pipeline.
    #[serde(default)]
    pub rtsp_url_queue: String,
    #[serde(default = "default_confidence_min")]
    pub confidence_min: f32,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_model")]
    pub queue_model: String,
    #[serde(default = "default_tracker")]
    pub tracker: String,

    #[serde(default = "default_counting_mode")]
    pub counting_mode: CountingMode,
    #[serde(default)]
    pub line_config: LineConfig,
    #[serde(default)]
    pub zones_config: ZonesConfig,
    #[serde(default)]
    pub zones_direction: ZoneDirections,
    #[serde(default = "default_zone_event_cooldown")]
    pub zone_event_cooldown: f64,

    #[serde(default)]
    pub use_roi_crop: bool,
    #[serde(default)]
    pub roi_crop: RoiCrop,

    #[serde(default = "default_rtsp_buffer_size")]
    pub rtsp_buffer_size: usize,
    #[serde(default)]
    pub rtsp_enable_frame_validation: bool,

    #[serde(default)]
    pub show_labels: bool,
    #[serde(default = "crate::default_true")]
    pub show_zone_tags: bool,
    #[serde(default)]
    pub hide_detection_lines: bool,
    #[serde(default)]
    pub hide_detection_boxes: bool,

    #[serde(default)]
    pub queue_config: QueueConfig,

    #[serde(default = "default_report_interval_min")]
    pub report_interval_min: u32,
}

pub(crate) fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        // serde fills every field from its default function
        serde_json::from_str("{}").expect("defaults must deserialize")
    }
}

impl AppConfig {
    /// Load from `path` with recovery: file → `<path>.backup` → defaults.
    ///
    /// A missing file is not an error; the defaults are written out so the
    /// operator has a document to edit. After any successful parse of the
    /// main file, the backup copy is refreshed.
    pub fn load<P: AsRef<Path>>(path: P) -> AppConfig {
        let path = path.as_ref();
        let backup = backup_path(path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
                Ok(mut cfg) => {
                    cfg.rtsp_url = cfg.rtsp_url.trim().to_string();
                    if let Err(e) = cfg.save_to(&backup) {
                        warn!("could not refresh config backup {}: {e}", backup.display());
                    } else {
                        debug!("config backup refreshed");
                    }
                    cfg
                }
                Err(parse_err) => {
                    warn!(
                        "config {} failed to parse ({parse_err}), trying backup",
                        path.display()
                    );
                    match Self::load_exact(&backup) {
                        Ok(cfg) => {
                            info!("recovered configuration from {}", backup.display());
                            if let Err(e) = cfg.save_to(path) {
                                warn!("could not rewrite config from backup: {e}");
                            }
                            cfg
                        }
                        Err(backup_err) => {
                            warn!(
                                "backup {} unusable ({backup_err}), using defaults",
                                backup.display()
                            );
                            let cfg = AppConfig::default();
                            if let Err(e) = cfg.save_to(path) {
                                warn!("could not write default config: {e}");
                            }
                            cfg
                        }
                    }
                }
            },
            Err(_) => {
                info!("config {} not found, creating defaults", path.display());
                let cfg = AppConfig::default();
                if let Err(e) = cfg.save_to(path) {
                    warn!("could not write default config: {e}");
                }
                cfg
            }
        }
    }

    /// Strict load with no recovery, used for the backup file and by tests.
    pub fn load_exact<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: AppConfig = serde_json::from_str(&contents)?;
        cfg.rtsp_url = cfg.rtsp_url.trim().to_string();
        Ok(cfg)
    }

    /// Serialize to `path` atomically: write a temporary sibling file, then
    /// rename it over the target.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::NamedTempFile::new_in(dir)?
            }
            None => tempfile::NamedTempFile::new_in(".")?,
        };
        let pretty = serde_json::to_string_pretty(self)?;
        tmp.write_all(pretty.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)?;
        Ok(())
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".backup");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneflow_types::DirectionMode;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.confidence_min, 0.5);
        assert_eq!(cfg.counting_mode, CountingMode::Line);
        assert_eq!(cfg.zone_event_cooldown, 0.8);
        assert_eq!(cfg.queue_config.min_wait_time, 5.0);
        assert_eq!(cfg.queue_config.threshold_seconds, 60.0);
        assert_eq!(cfg.line_config.direction_mode, DirectionMode::Both);
        assert!(cfg.show_zone_tags);
        assert!(!cfg.show_labels);
        assert!(!cfg.use_roi_crop);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"rtsp_url": "rtsp://cam", "some_future_key": 42}"#).unwrap();
        assert_eq!(cfg.rtsp_url, "rtsp://cam");
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = AppConfig::default();
        cfg.rtsp_url = "rtsp://user:pw@10.0.0.7/stream1".to_string();
        cfg.counting_mode = CountingMode::Zone;
        cfg.queue_config.polygon = vec![[0.1, 0.5], [0.9, 0.5], [0.5, 0.95]];
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_exact(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn corrupt_file_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = AppConfig::default();
        cfg.rtsp_url = "rtsp://cam-a".to_string();
        cfg.save_to(&path).unwrap();
        // first load writes the backup
        let first = AppConfig::load(&path);
        assert_eq!(first.rtsp_url, "rtsp://cam-a");

        std::fs::write(&path, "{ this is not json").unwrap();
        let recovered = AppConfig::load(&path);
        assert_eq!(recovered.rtsp_url, "rtsp://cam-a");
    }

    #[test]
    fn corrupt_file_and_backup_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let cfg = AppConfig::load(&path);
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn rtsp_url_is_trimmed() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"rtsp_url": "  rtsp://cam  "}"#).unwrap();
        // trim happens on load paths
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        cfg.save_to(&path).unwrap();
        let loaded = AppConfig::load_exact(&path).unwrap();
        assert_eq!(loaded.rtsp_url, "rtsp://cam");
    }

    #[test]
    fn direction_mode_wire_names_parse() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"line_config": {"direction_mode": "volta_only", "x_mid_ratio": 0.5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.line_config.direction_mode, DirectionMode::ReturnOnly);
        assert_eq!(cfg.line_config.x_mid_ratio, Some(0.5));
    }
}

//! Daemon configuration.
//!
//! Both daemons read a JSON config file named by an environment variable,
//! merge it over built-in defaults, apply individual env overrides, and
//! validate before anything starts. All values are read once at startup;
//! only the motion parameters are hot-reloadable (the edge daemon polls
//! the file and ships a fresh `MotionSettings` snapshot to the capture
//! loops when it changes).

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::MotionSettings;
use crate::{validate_camera_id, CameraRole, CameraSpec};

const DEFAULT_EDGE_DB_PATH: &str = "watchpost.db";
const DEFAULT_STORAGE_ROOT: &str = "segments";
const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8790";
const DEFAULT_PRE_MOTION_SECS: u32 = 15;
const DEFAULT_MOTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_SEGMENT_SECS: u64 = 300;
const DEFAULT_CROSS_TRIGGER_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_UPLOAD_ATTEMPTS: u32 = 8;
const DEFAULT_LOCAL_RETENTION_DAYS: u64 = 3;

const DEFAULT_HUB_DB_PATH: &str = "hub.db";
const DEFAULT_HUB_SPOOL_ROOT: &str = "spool";
const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_FRAME_STRIDE: usize = 5;
const DEFAULT_INFERENCE_DEADLINE_SECS: u64 = 60;
const DEFAULT_CLUSTER_WINDOW_SECS: u64 = 5;
const DEFAULT_DETECTION_RETENTION_DAYS: u64 = 30;
const DEFAULT_NO_DETECTION_RETENTION_DAYS: u64 = 7;

// -------------------- Edge daemon --------------------

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    db_path: Option<String>,
    storage_root: Option<PathBuf>,
    cameras: Option<Vec<CameraSpecFile>>,
    motion: Option<MotionConfigFile>,
    recorder: Option<RecorderConfigFile>,
    sync: Option<SyncConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraSpecFile {
    id: String,
    role: CameraRole,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    source: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    sensitivity: Option<f32>,
    min_area: Option<u32>,
    roi: Option<crate::BoundingBox>,
    pre_motion_seconds: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    motion_timeout_seconds: Option<u64>,
    max_segment_seconds: Option<u64>,
    cross_trigger_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    hub_url: Option<String>,
    interval_seconds: Option<u64>,
    upload_timeout_seconds: Option<u64>,
    max_attempts: Option<u32>,
    local_retention_days: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct EdgeConfig {
    pub db_path: String,
    pub storage_root: PathBuf,
    pub cameras: Vec<CameraSpec>,
    pub motion: MotionSettings,
    pub pre_motion_seconds: u32,
    pub motion_timeout: Duration,
    pub max_segment_duration: Duration,
    pub cross_trigger_timeout: Duration,
    pub hub_url: String,
    pub sync_interval: Duration,
    pub upload_timeout: Duration,
    pub max_upload_attempts: u32,
    pub local_retention: Duration,
}

impl EdgeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_json_file::<EdgeConfigFile>(path)?,
            None => EdgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Re-read only the hot-reloadable motion parameters.
    pub fn reload_motion(path: &Path) -> Result<MotionSettings> {
        let file_cfg = read_json_file::<EdgeConfigFile>(path)?;
        Ok(motion_from_file(file_cfg.motion.as_ref()))
    }

    fn from_file(file: EdgeConfigFile) -> Result<Self> {
        let db_path = file
            .db_path
            .unwrap_or_else(|| DEFAULT_EDGE_DB_PATH.to_string());
        let storage_root = file
            .storage_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));

        let cameras = match file.cameras {
            Some(entries) => entries
                .into_iter()
                .map(|camera| CameraSpec {
                    id: camera.id,
                    role: camera.role,
                    width: camera.width.unwrap_or(640),
                    height: camera.height.unwrap_or(480),
                    fps: camera.fps.unwrap_or(10),
                    source: camera
                        .source
                        .unwrap_or_else(|| "stub://pulse".to_string()),
                })
                .collect(),
            None => vec![CameraSpec {
                id: "front_door".to_string(),
                role: CameraRole::Active,
                width: 640,
                height: 480,
                fps: 10,
                source: "stub://pulse".to_string(),
            }],
        };

        let motion = motion_from_file(file.motion.as_ref());
        let pre_motion_seconds = file
            .motion
            .as_ref()
            .and_then(|m| m.pre_motion_seconds)
            .unwrap_or(DEFAULT_PRE_MOTION_SECS);

        let recorder = file.recorder.unwrap_or_default();
        let sync = file.sync.unwrap_or_default();

        Ok(Self {
            db_path,
            storage_root,
            cameras,
            motion,
            pre_motion_seconds,
            motion_timeout: Duration::from_secs(
                recorder
                    .motion_timeout_seconds
                    .unwrap_or(DEFAULT_MOTION_TIMEOUT_SECS),
            ),
            max_segment_duration: Duration::from_secs(
                recorder
                    .max_segment_seconds
                    .unwrap_or(DEFAULT_MAX_SEGMENT_SECS),
            ),
            cross_trigger_timeout: Duration::from_millis(
                recorder
                    .cross_trigger_timeout_ms
                    .unwrap_or(DEFAULT_CROSS_TRIGGER_TIMEOUT_MS),
            ),
            hub_url: sync.hub_url.unwrap_or_else(|| DEFAULT_HUB_URL.to_string()),
            sync_interval: Duration::from_secs(
                sync.interval_seconds.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            ),
            upload_timeout: Duration::from_secs(
                sync.upload_timeout_seconds
                    .unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS),
            ),
            max_upload_attempts: sync.max_attempts.unwrap_or(DEFAULT_MAX_UPLOAD_ATTEMPTS),
            local_retention: Duration::from_secs(
                sync.local_retention_days
                    .unwrap_or(DEFAULT_LOCAL_RETENTION_DAYS)
                    * 24
                    * 60
                    * 60,
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("WATCHPOST_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(root) = std::env::var("WATCHPOST_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                self.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(url) = std::env::var("WATCHPOST_HUB_URL") {
            if !url.trim().is_empty() {
                self.hub_url = url;
            }
        }
        if let Ok(secs) = std::env::var("WATCHPOST_SYNC_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("WATCHPOST_SYNC_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.sync_interval = Duration::from_secs(secs);
        }
        if let Ok(secs) = std::env::var("WATCHPOST_UPLOAD_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("WATCHPOST_UPLOAD_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.upload_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            validate_camera_id(&camera.id)?;
            if !seen.insert(camera.id.clone()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
            if camera.fps == 0 {
                return Err(anyhow!("camera '{}': fps must be > 0", camera.id));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera '{}': resolution must be non-zero", camera.id));
            }
        }
        if !self
            .cameras
            .iter()
            .any(|camera| camera.role == CameraRole::Active)
        {
            return Err(anyhow!("at least one active camera is required"));
        }
        if self.motion.sensitivity <= 0.0 {
            return Err(anyhow!("motion sensitivity must be > 0"));
        }
        if self.pre_motion_seconds == 0 {
            return Err(anyhow!("pre_motion_seconds must be > 0"));
        }
        if self.motion_timeout.is_zero() || self.max_segment_duration.is_zero() {
            return Err(anyhow!("recorder timeouts must be greater than zero"));
        }
        if self.sync_interval.is_zero() || self.upload_timeout.is_zero() {
            return Err(anyhow!("sync intervals must be greater than zero"));
        }
        if self.max_upload_attempts == 0 {
            return Err(anyhow!("max upload attempts must be >= 1"));
        }
        Ok(())
    }
}

fn motion_from_file(file: Option<&MotionConfigFile>) -> MotionSettings {
    let defaults = MotionSettings::default();
    match file {
        Some(motion) => MotionSettings {
            sensitivity: motion.sensitivity.unwrap_or(defaults.sensitivity),
            min_area: motion.min_area.unwrap_or(defaults.min_area),
            roi: motion.roi.or(defaults.roi),
        },
        None => defaults,
    }
}

// -------------------- Hub daemon --------------------

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    db_path: Option<String>,
    spool_root: Option<PathBuf>,
    listen_addr: Option<String>,
    processing: Option<ProcessingConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessingConfigFile {
    frame_stride: Option<usize>,
    inference_deadline_seconds: Option<u64>,
    cluster_window_seconds: Option<u64>,
    confidence_thresholds: Option<HashMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    detection_days: Option<u64>,
    no_detection_days: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub db_path: String,
    pub spool_root: PathBuf,
    pub listen_addr: String,
    /// Sample every Nth frame into inference for throughput.
    pub frame_stride: usize,
    pub inference_deadline: Duration,
    pub cluster_window: Duration,
    /// Per-class confidence floors handed to the inference collaborator.
    pub confidence_thresholds: HashMap<String, f32>,
    pub detection_retention: Duration,
    pub no_detection_retention: Duration,
}

impl HubConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_HUB_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_json_file::<HubConfigFile>(path)?,
            None => HubConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HubConfigFile) -> Self {
        let processing = file.processing.unwrap_or_default();
        let retention = file.retention.unwrap_or_default();
        Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| DEFAULT_HUB_DB_PATH.to_string()),
            spool_root: file
                .spool_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HUB_SPOOL_ROOT)),
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string()),
            frame_stride: processing.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
            inference_deadline: Duration::from_secs(
                processing
                    .inference_deadline_seconds
                    .unwrap_or(DEFAULT_INFERENCE_DEADLINE_SECS),
            ),
            cluster_window: Duration::from_secs(
                processing
                    .cluster_window_seconds
                    .unwrap_or(DEFAULT_CLUSTER_WINDOW_SECS),
            ),
            confidence_thresholds: processing
                .confidence_thresholds
                .unwrap_or_else(default_confidence_thresholds),
            detection_retention: Duration::from_secs(
                retention
                    .detection_days
                    .unwrap_or(DEFAULT_DETECTION_RETENTION_DAYS)
                    * 24
                    * 60
                    * 60,
            ),
            no_detection_retention: Duration::from_secs(
                retention
                    .no_detection_days
                    .unwrap_or(DEFAULT_NO_DETECTION_RETENTION_DAYS)
                    * 24
                    * 60
                    * 60,
            ),
        }
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("WATCHPOST_HUB_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("WATCHPOST_HUB_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(root) = std::env::var("WATCHPOST_HUB_SPOOL") {
            if !root.trim().is_empty() {
                self.spool_root = PathBuf::from(root);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.frame_stride == 0 {
            return Err(anyhow!("frame_stride must be >= 1"));
        }
        if self.inference_deadline.is_zero() {
            return Err(anyhow!("inference deadline must be greater than zero"));
        }
        for (label, threshold) in &self.confidence_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(anyhow!(
                    "confidence threshold for '{}' out of bounds",
                    label
                ));
            }
        }
        Ok(())
    }
}

fn default_confidence_thresholds() -> HashMap<String, f32> {
    HashMap::from([
        ("person".to_string(), 0.5),
        ("vehicle".to_string(), 0.5),
        ("animal".to_string(), 0.4),
    ])
}

fn read_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let edge = EdgeConfig::load_from(None).expect("edge defaults");
        assert_eq!(edge.pre_motion_seconds, 15);
        assert_eq!(edge.motion_timeout.as_secs(), 30);
        assert_eq!(edge.max_segment_duration.as_secs(), 300);
        assert_eq!(edge.cameras.len(), 1);

        let hub = HubConfig::load_from(None).expect("hub defaults");
        assert_eq!(hub.frame_stride, 5);
        assert_eq!(hub.cluster_window.as_secs(), 5);
    }

    #[test]
    fn duplicate_camera_ids_are_rejected() {
        let file = EdgeConfigFile {
            cameras: Some(vec![
                CameraSpecFile {
                    id: "gate".to_string(),
                    role: CameraRole::Active,
                    width: None,
                    height: None,
                    fps: None,
                    source: None,
                },
                CameraSpecFile {
                    id: "gate".to_string(),
                    role: CameraRole::Passive,
                    width: None,
                    height: None,
                    fps: None,
                    source: None,
                },
            ]),
            ..Default::default()
        };
        let mut cfg = EdgeConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn a_fleet_of_only_passive_cameras_is_rejected() {
        let file = EdgeConfigFile {
            cameras: Some(vec![CameraSpecFile {
                id: "gate".to_string(),
                role: CameraRole::Passive,
                width: None,
                height: None,
                fps: None,
                source: None,
            }]),
            ..Default::default()
        };
        let mut cfg = EdgeConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_file_values_override_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("edge.json");
        std::fs::write(
            &path,
            r#"{
                "db_path": "edge_prod.db",
                "cameras": [
                    {"id": "front_door", "role": "active", "fps": 15},
                    {"id": "back_gate", "role": "passive"}
                ],
                "motion": {"sensitivity": 40.0, "min_area": 128, "pre_motion_seconds": 10},
                "recorder": {"motion_timeout_seconds": 20, "max_segment_seconds": 120},
                "sync": {"hub_url": "http://hub:8790", "interval_seconds": 60}
            }"#,
        )?;

        let cfg = EdgeConfig::load_from(Some(&path))?;
        assert_eq!(cfg.db_path, "edge_prod.db");
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.cameras[0].fps, 15);
        assert_eq!(cfg.motion.sensitivity, 40.0);
        assert_eq!(cfg.motion.min_area, 128);
        assert_eq!(cfg.pre_motion_seconds, 10);
        assert_eq!(cfg.motion_timeout.as_secs(), 20);
        assert_eq!(cfg.max_segment_duration.as_secs(), 120);
        assert_eq!(cfg.hub_url, "http://hub:8790");
        assert_eq!(cfg.sync_interval.as_secs(), 60);
        Ok(())
    }

    #[test]
    fn reload_motion_reads_only_motion_parameters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("edge.json");
        std::fs::write(&path, r#"{"motion": {"sensitivity": 55.0}}"#)?;
        let settings = EdgeConfig::reload_motion(&path)?;
        assert_eq!(settings.sensitivity, 55.0);
        assert_eq!(settings.min_area, MotionSettings::default().min_area);
        Ok(())
    }

    #[test]
    fn out_of_bounds_confidence_threshold_is_rejected() {
        let file = HubConfigFile {
            processing: Some(ProcessingConfigFile {
                confidence_thresholds: Some(HashMap::from([("person".to_string(), 1.5)])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = HubConfig::from_file(file);
        assert!(cfg.validate().is_err());
    }
}

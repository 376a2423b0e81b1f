use std::path::Path;

use pupil_types::ProcMode;
use tracing::warn;

/// Persisted application settings.
///
/// The processing mode is stored as a string so a stale or hand-edited file
/// cannot poison the typed configuration: an unknown value is replaced by
/// the single-image-one-pupil default and written back once.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub proc_mode: String,
    pub expected_max_pupil_size_percent: f64,
    pub stream_template: String,
    pub always_on_top: bool,
    pub dark_mode: bool,
    pub metadata_snapshots_enabled: bool,
    pub offline_event_log_save: bool,
    pub sync_record_csv_with_playback: bool,
    pub sync_stream_with_playback: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proc_mode: "single_image_one_pupil".to_string(),
            expected_max_pupil_size_percent: 50.0,
            stream_template: "trial;timestamp;center;diameter;confidence".to_string(),
            always_on_top: false,
            dark_mode: false,
            metadata_snapshots_enabled: true,
            offline_event_log_save: false,
            sync_record_csv_with_playback: false,
            sync_stream_with_playback: false,
        }
    }
}

impl Settings {
    /// Load settings, repairing an invalid persisted processing mode with a
    /// one-shot write-back.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path)?;
        let mut settings: Settings = serde_yaml::from_str(&body)?;
        if settings.parse_proc_mode().is_none() {
            warn!(
                "unknown processing mode {:?} in {}, replacing with default",
                settings.proc_mode,
                path.display()
            );
            settings.proc_mode = Settings::default().proc_mode;
            settings.save(path)?;
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> eyre::Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// The typed mode, None when the persisted string is not a member of
    /// the closed enum (or is the undetermined placeholder).
    pub fn parse_proc_mode(&self) -> Option<ProcMode> {
        match serde_yaml::from_str::<ProcMode>(&self.proc_mode) {
            Ok(ProcMode::Undetermined) => None,
            Ok(mode) => Some(mode),
            Err(_) => None,
        }
    }
}

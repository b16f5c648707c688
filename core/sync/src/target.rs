//! Sync targets: identity plus the fixed policy of their class.

use std::path::Path;

use cloudsave_common::{Error, Result, SyncMode, TargetId, TargetKind};

use crate::config::SyncSettings;

/// Log directory shared by all capture targets.
const CAPTURE_LOG_KEY: &str = "captures";

/// Fixed attributes that distinguish target classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPolicy {
    pub mode: SyncMode,
    /// Whether the sync is restricted by filter files (and skipped without
    /// an include rule).
    pub filtered: bool,
}

impl TargetPolicy {
    pub const GLOBAL: Self = Self {
        mode: SyncMode::Bisync,
        filtered: true,
    };

    pub const CAPTURE: Self = Self {
        mode: SyncMode::Copy,
        filtered: false,
    };

    /// Per-application policy: mirror when strict, plain copy otherwise.
    pub fn app(strict: bool) -> Self {
        Self {
            mode: if strict { SyncMode::Sync } else { SyncMode::Copy },
            filtered: true,
        }
    }

    /// Only bidirectional targets can be forced into a baseline resync.
    pub fn supports_resync(&self) -> bool {
        self.mode.is_bidirectional()
    }
}

/// One synchronizable unit with its resolved endpoints.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    id: TargetId,
    policy: TargetPolicy,
    source: String,
    destination: String,
    log_key: String,
}

impl SyncTarget {
    /// The shared target: the whole sync root, reconciled both ways.
    pub fn global(settings: &SyncSettings) -> Self {
        let id = TargetId::global();
        Self {
            log_key: id.to_string(),
            policy: TargetPolicy::GLOBAL,
            source: settings.sync_root.clone(),
            destination: settings.remote(&settings.destination_directory),
            id,
        }
    }

    /// A per-application target.
    ///
    /// # Errors
    /// - `app_id` is not a positive integer
    pub fn app(app_id: i64, settings: &SyncSettings) -> Result<Self> {
        let app_id = u64::try_from(app_id).map_err(|_| {
            Error::InvalidTarget(format!("Invalid app id {}, must be positive", app_id))
        })?;
        let id = TargetId::app(app_id)?;
        Ok(Self {
            log_key: id.to_string(),
            policy: TargetPolicy::app(settings.strict_sync),
            source: settings.sync_root.clone(),
            destination: settings.remote(&settings.destination_directory),
            id,
        })
    }

    /// A single captured file, copied into the capture destination.
    ///
    /// # Errors
    /// - `path` is empty or has no file name
    pub fn capture(path: impl AsRef<Path>, settings: &SyncSettings) -> Result<Self> {
        let path = path.as_ref();
        let id = TargetId::capture(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = settings.capture_destination.trim_end_matches('/');
        Ok(Self {
            id,
            policy: TargetPolicy::CAPTURE,
            source: path.display().to_string(),
            destination: settings.remote(&format!("{}/{}", directory, file_name)),
            log_key: CAPTURE_LOG_KEY.to_string(),
        })
    }

    /// Resolve a host-supplied id (`global` or an application id).
    pub fn from_id(id: &TargetId, settings: &SyncSettings) -> Result<Self> {
        match id.kind() {
            TargetKind::Global => Ok(Self::global(settings)),
            TargetKind::App(app_id) => {
                let app_id = i64::try_from(app_id)
                    .map_err(|_| Error::InvalidTarget(format!("App id out of range: {}", app_id)))?;
                Self::app(app_id, settings)
            }
            TargetKind::Capture => Err(Error::InvalidTarget(format!(
                "Capture targets are built from a file path, not an id: {}",
                id
            ))),
        }
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn policy(&self) -> TargetPolicy {
        self.policy
    }

    pub fn mode(&self) -> SyncMode {
        self.policy.mode
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Key of the log directory this target writes to.
    pub fn log_key(&self) -> &str {
        &self.log_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_bidirectional() {
        let target = SyncTarget::global(&SyncSettings::default());
        assert_eq!(target.id().as_str(), "global");
        assert_eq!(target.mode(), SyncMode::Bisync);
        assert!(target.policy().filtered);
        assert!(target.policy().supports_resync());
        assert_eq!(target.source(), "/");
        assert_eq!(target.destination(), "backend:decky-cloud-save");
    }

    #[test]
    fn test_app_mode_follows_strict_setting() {
        let strict = SyncTarget::app(440, &SyncSettings::default()).unwrap();
        assert_eq!(strict.id().as_str(), "440");
        assert_eq!(strict.mode(), SyncMode::Sync);
        assert!(!strict.policy().supports_resync());

        let relaxed = SyncSettings {
            strict_sync: false,
            ..Default::default()
        };
        assert_eq!(SyncTarget::app(440, &relaxed).unwrap().mode(), SyncMode::Copy);
    }

    #[test]
    fn test_app_rejects_non_positive_ids() {
        let settings = SyncSettings::default();
        assert!(matches!(
            SyncTarget::app(0, &settings),
            Err(Error::InvalidTarget(_))
        ));
        assert!(matches!(
            SyncTarget::app(-5, &settings),
            Err(Error::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_capture_destination_joins_file_name() {
        let settings = SyncSettings {
            capture_destination: "deck-libraries/Pictures/".to_string(),
            ..Default::default()
        };
        let target = SyncTarget::capture("/tmp/shot.jpg", &settings).unwrap();
        assert_eq!(target.mode(), SyncMode::Copy);
        assert!(!target.policy().filtered);
        assert_eq!(target.source(), "/tmp/shot.jpg");
        assert_eq!(target.destination(), "backend:deck-libraries/Pictures/shot.jpg");
        assert_eq!(target.log_key(), "captures");
    }

    #[test]
    fn test_capture_rejects_empty_path() {
        assert!(SyncTarget::capture("", &SyncSettings::default()).is_err());
    }

    #[test]
    fn test_from_id() {
        let settings = SyncSettings::default();
        let target = SyncTarget::from_id(&TargetId::parse("440").unwrap(), &settings).unwrap();
        assert_eq!(target.id().as_str(), "440");

        let capture = TargetId::capture("/tmp/a.png").unwrap();
        assert!(SyncTarget::from_id(&capture, &settings).is_err());
    }
}

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable key naming a physical device across sessions.
///
/// Built as `serial_vendor_model`, or `vendor_model` when the device reports no serial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(serial: &str, vendor: &str, model: &str) -> Self {
        let (serial, vendor, model) = (serial.trim(), vendor.trim(), model.trim());
        if serial.is_empty() {
            Self(format!("{vendor}_{model}"))
        } else {
            Self(format!("{serial}_{vendor}_{model}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A USB partition as currently seen by the watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device_node: PathBuf,
    pub parent_device: Option<PathBuf>,
    pub serial: String,
    pub vendor: String,
    pub model: String,
    pub label: String,
    pub fs_type: String,
    pub size_bytes: u64,
    pub removable: bool,
    pub mount_point: Option<PathBuf>,
}

impl DeviceSnapshot {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.serial, &self.vendor, &self.model)
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }

    pub fn display_name(&self) -> String {
        if !self.label.is_empty() {
            return self.label.clone();
        }
        let name = format!("{} {}", self.vendor, self.model);
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
        self.device_node
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.device_node.display().to_string())
    }

    /// Device to power off on eject: the whole disk when known.
    pub fn power_target(&self) -> &Path {
        self.parent_device.as_deref().unwrap_or(&self.device_node)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_node: self.device_node.display().to_string(),
            serial: self.serial.clone(),
            vendor: self.vendor.clone(),
            model: self.model.clone(),
            label: self.label.clone(),
            fs_type: self.fs_type.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// Last-known snapshot stored alongside a record for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub device_node: String,
    pub serial: String,
    pub vendor: String,
    pub model: String,
    pub label: String,
    pub fs_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum TrustLevel {
    #[default]
    New,
    Trusted,
    AlwaysAllow,
}

impl From<u8> for TrustLevel {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Trusted,
            _ => Self::AlwaysAllow,
        }
    }
}

impl From<TrustLevel> for u8 {
    fn from(value: TrustLevel) -> Self {
        match value {
            TrustLevel::New => 0,
            TrustLevel::Trusted => 1,
            TrustLevel::AlwaysAllow => 2,
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Trusted => "trusted",
            Self::AlwaysAllow => "always-allow",
        };
        f.write_str(s)
    }
}

/// A whitelisted device as persisted in the whitelist file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub unique_id: DeviceIdentity,
    #[serde(default)]
    pub hash: String,
    #[serde(default = "default_algorithm")]
    pub hash_algorithm: String,
    #[serde(default, with = "timestamp")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_hashed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hash_duration_ms: u64,
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default)]
    pub auto_mount: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub device_info: DeviceInfo,
}

fn default_algorithm() -> String {
    "SHA256".to_string()
}

impl DeviceRecord {
    /// New record for a device being whitelisted now, without a baseline hash.
    pub fn new(snapshot: &DeviceSnapshot, trust_level: TrustLevel) -> Self {
        let now = Utc::now();
        Self {
            unique_id: snapshot.identity(),
            hash: String::new(),
            hash_algorithm: default_algorithm(),
            first_seen: Some(now),
            last_seen: Some(now),
            last_hashed: None,
            hash_duration_ms: 0,
            trust_level,
            auto_mount: false,
            notes: String::new(),
            device_info: snapshot.info(),
        }
    }

    pub fn has_hash(&self) -> bool {
        !self.hash.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationStatus {
    Unknown,
    Pending,
    Hashing,
    Verified,
    Modified,
    NewDevice,
    Error,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Hashing => "hashing",
            Self::Verified => "verified",
            Self::Modified => "modified",
            Self::NewDevice => "new device",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// RFC 3339 timestamps stored as strings; empty or unparseable values load as `None`.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(parse(&raw))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        // Local ISO-8601 without an offset, as older whitelist files wrote it.
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(serial: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            device_node: PathBuf::from("/dev/sdb1"),
            parent_device: Some(PathBuf::from("/dev/sdb")),
            serial: serial.to_string(),
            vendor: "SanDisk".to_string(),
            model: "Ultra".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_uses_serial_when_present() {
        assert_eq!(snapshot("S1").identity().as_str(), "S1_SanDisk_Ultra");
        assert_eq!(snapshot("").identity().as_str(), "SanDisk_Ultra");
    }

    #[test]
    fn test_identity_stable_across_mount_and_fs_changes() {
        let first = snapshot("4C530001");
        let mut later = first.clone();
        later.device_node = PathBuf::from("/dev/sdc1");
        later.mount_point = Some(PathBuf::from("/media/usb"));
        later.fs_type = "exfat".to_string();
        later.label = "RELABELED".to_string();
        assert_eq!(first.identity(), later.identity());
    }

    #[test]
    fn test_identity_ignores_surrounding_whitespace() {
        assert_eq!(
            DeviceIdentity::new(" S1 ", "SanDisk ", " Ultra"),
            DeviceIdentity::new("S1", "SanDisk", "Ultra")
        );
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut dev = snapshot("S1");
        dev.label = "BACKUP".to_string();
        assert_eq!(dev.display_name(), "BACKUP");
        dev.label.clear();
        assert_eq!(dev.display_name(), "SanDisk Ultra");
        dev.vendor.clear();
        dev.model.clear();
        assert_eq!(dev.display_name(), "sdb1");
    }

    #[test]
    fn test_power_target_prefers_whole_disk() {
        let mut dev = snapshot("S1");
        assert_eq!(dev.power_target(), Path::new("/dev/sdb"));
        dev.parent_device = None;
        assert_eq!(dev.power_target(), Path::new("/dev/sdb1"));
    }

    #[test]
    fn test_trust_level_serializes_as_number() {
        assert_eq!(serde_json::to_string(&TrustLevel::Trusted).unwrap(), "1");
        let parsed: TrustLevel = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, TrustLevel::AlwaysAllow);
        let clamped: TrustLevel = serde_json::from_str("9").unwrap();
        assert_eq!(clamped, TrustLevel::AlwaysAllow);
    }

    #[test]
    fn test_record_timestamps_are_lenient() {
        let json = r#"{
            "unique_id": "S1_SanDisk_Ultra",
            "hash": "abc",
            "first_seen": "not a date",
            "last_seen": "2024-03-01T10:15:00",
            "last_hashed": ""
        }"#;
        let record: DeviceRecord = serde_json::from_str(json).unwrap();
        assert!(record.first_seen.is_none());
        assert!(record.last_seen.is_some());
        assert!(record.last_hashed.is_none());
        assert_eq!(record.hash_algorithm, "SHA256");
        assert_eq!(record.trust_level, TrustLevel::New);
    }

    #[test]
    fn test_record_timestamp_precision_survives_serialization() {
        let record = DeviceRecord::new(&snapshot("S1"), TrustLevel::Trusted);
        let json = serde_json::to_string(&record).unwrap();
        let back: DeviceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_timestamp_parse_accepts_offsets() {
        let ts = timestamp::parse("2024-03-01T10:15:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T08:15:00+00:00");
    }
}

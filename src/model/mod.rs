use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub type DeviceId = i64;

/// Catalog entry from the `GetDevices` directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Device {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Prizrak {}", self.device_id))
    }
}

/// Accumulated state of one device. Push events only ever merge into `fields`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub fields: Map<String, Value>,
    pub last_updated_unix_ms: u64,
}

impl DeviceState {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            fields: Map::new(),
            last_updated_unix_ms: 0,
        }
    }

    /// Looks up a field by dotted path, e.g. `geo.lat` or `balance.value`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut value = self.fields.get(parts.next()?)?;
        for part in parts {
            value = value.as_object()?.get(part)?;
        }
        Some(value)
    }

    pub fn field_str(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(Value::as_str)
    }
}

/// Pushed to [`crate::dispatch::DeviceStateSink`] consumers that fan updates out.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUpdate {
    pub device_id: DeviceId,
    pub partial: Map<String, Value>,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCommand {
    GuardOn,
    GuardOff,
    AutolaunchOn,
    AutolaunchOff,
}

impl DeviceCommand {
    pub const ALL: [DeviceCommand; 4] = [
        DeviceCommand::GuardOn,
        DeviceCommand::GuardOff,
        DeviceCommand::AutolaunchOn,
        DeviceCommand::AutolaunchOff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GuardOn => "GuardOn",
            Self::GuardOff => "GuardOff",
            Self::AutolaunchOn => "AutolaunchOn",
            Self::AutolaunchOff => "AutolaunchOff",
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for DeviceCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownCommand(trimmed.to_string()))
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reason the previous boot gave up, persisted across exactly one reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    WifiConfig,
    DbConfig,
}

impl ErrorKind {
    pub const NONE_CODE: i32 = -1;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WifiConfig => "WIFI_CONFIG",
            Self::DbConfig => "DB_CONFIG",
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::WifiConfig => 1,
            Self::DbConfig => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::WifiConfig),
            2 => Some(Self::DbConfig),
            _ => None,
        }
    }
}

/// Which field groups the provisioning form asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormScope {
    Full,
    NetworkOnly,
    DatabaseOnly,
}

impl FormScope {
    pub fn for_last_error(last_error: Option<ErrorKind>) -> Self {
        match last_error {
            Some(ErrorKind::WifiConfig) => Self::NetworkOnly,
            Some(ErrorKind::DbConfig) => Self::DatabaseOnly,
            None => Self::Full,
        }
    }

    pub fn includes_network(self) -> bool {
        matches!(self, Self::Full | Self::NetworkOnly)
    }

    pub fn includes_database(self) -> bool {
        matches!(self, Self::Full | Self::DatabaseOnly)
    }

    pub fn includes_device_name(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Stored network credentials; `None` means the key was never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSettings {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

/// Stored database parameters; `None` means the key was never written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbSettings {
    pub url: Option<String>,
    pub token: Option<String>,
    pub organization: Option<String>,
    pub bucket: Option<String>,
}

impl DbSettings {
    /// Returns the complete endpoint, or `None` when any parameter is missing.
    pub fn endpoint(&self) -> Option<DbEndpoint> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Some(DbEndpoint {
            url: present(&self.url)?,
            token: present(&self.token)?,
            organization: present(&self.organization)?,
            bucket: present(&self.bucket)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEndpoint {
    pub url: String,
    pub token: String,
    pub organization: String,
    pub bucket: String,
}

/// A single probe sample in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading(pub f32);

impl SensorReading {
    /// Value reported by a DS18B20 bus when no probe answers.
    pub const DISCONNECTED_C: f32 = -127.0;
    pub const DISCONNECTED: Self = Self(Self::DISCONNECTED_C);

    pub fn celsius(value: f32) -> Self {
        Self(value)
    }

    pub fn is_disconnected(self) -> bool {
        self.0 == Self::DISCONNECTED_C
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_storage_encoding() {
        for kind in [ErrorKind::WifiConfig, ErrorKind::DbConfig] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(ErrorKind::NONE_CODE), None);
        assert_eq!(ErrorKind::from_code(7), None);
    }

    #[test]
    fn form_scope_follows_last_failure() {
        assert_eq!(FormScope::for_last_error(None), FormScope::Full);

        let network = FormScope::for_last_error(Some(ErrorKind::WifiConfig));
        assert!(network.includes_network());
        assert!(!network.includes_database());

        let database = FormScope::for_last_error(Some(ErrorKind::DbConfig));
        assert!(!database.includes_network());
        assert!(database.includes_database());
        assert!(!database.includes_device_name());
    }

    #[test]
    fn endpoint_requires_every_parameter() {
        let mut settings = DbSettings {
            url: Some("http://influx.local:8086".to_string()),
            token: Some("tok".to_string()),
            organization: Some("home".to_string()),
            bucket: None,
        };
        assert!(settings.endpoint().is_none());

        settings.bucket = Some("  ".to_string());
        assert!(settings.endpoint().is_none());

        settings.bucket = Some("sensors".to_string());
        let endpoint = settings.endpoint().unwrap();
        assert_eq!(endpoint.bucket, "sensors");
    }
}

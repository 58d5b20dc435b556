use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{info, warn};

use crate::{
    error::StoreError,
    types::{DbSettings, ErrorKind, NetworkSettings},
};

pub mod keys {
    pub const CONFIGURED: &str = "hconf";
    pub const WIFI_SSID: &str = "ssid";
    pub const WIFI_PASSWORD: &str = "passwd";
    pub const DEVICE_NAME: &str = "name";
    pub const DB_URL: &str = "url";
    pub const DB_TOKEN: &str = "token";
    pub const DB_ORGANIZATION: &str = "org";
    pub const DB_BUCKET: &str = "buck";
    pub const LAST_ERROR: &str = "fail";

    pub const ALL: [&str; 9] = [
        CONFIGURED,
        WIFI_SSID,
        WIFI_PASSWORD,
        DEVICE_NAME,
        DB_URL,
        DB_TOKEN,
        DB_ORGANIZATION,
        DB_BUCKET,
        LAST_ERROR,
    ];
}

/// Durable key/value backend, shared between the control loop and the
/// request handler thread.
pub trait KeyValueStorage: Clone + Send + 'static {
    type Session<'a>: StorageSession
    where
        Self: 'a;

    /// Opens the namespace; dropping the session releases it.
    fn open(&self, namespace: &str) -> Result<Self::Session<'_>, StoreError>;
}

pub trait StorageSession {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError>;
    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;
    fn get_bool(&mut self, key: &str) -> Result<Option<bool>, StoreError>;
    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn erase_all(&mut self) -> Result<(), StoreError>;
}

/// The node's persisted configuration record.
///
/// Only the configured flag is cached; it is refreshed by [`reload`] and by
/// [`set_configured`]. Every other read goes to the backing store.
///
/// [`reload`]: PersistedConfig::reload
/// [`set_configured`]: PersistedConfig::set_configured
#[derive(Clone)]
pub struct PersistedConfig<S> {
    storage: S,
    namespace: String,
    configured: bool,
}

impl<S: KeyValueStorage> PersistedConfig<S> {
    pub fn new(storage: S, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
            configured: false,
        }
    }

    pub fn write_network_config(&self, ssid: &str, password: &str) -> Result<(), StoreError> {
        self.write_fields(&[(keys::WIFI_SSID, ssid), (keys::WIFI_PASSWORD, password)])
    }

    pub fn write_db_config(
        &self,
        url: &str,
        token: &str,
        organization: &str,
        bucket: &str,
    ) -> Result<(), StoreError> {
        self.write_fields(&[
            (keys::DB_URL, url),
            (keys::DB_TOKEN, token),
            (keys::DB_ORGANIZATION, organization),
            (keys::DB_BUCKET, bucket),
        ])
    }

    pub fn write_device_name(&self, name: &str) -> Result<(), StoreError> {
        self.write_fields(&[(keys::DEVICE_NAME, name)])
    }

    pub fn set_configured(&mut self, configured: bool) -> Result<(), StoreError> {
        {
            let mut session = self.storage.open(&self.namespace)?;
            session.set_bool(keys::CONFIGURED, configured)?;
        }
        self.reload()
    }

    pub fn set_error_code(&self, code: Option<ErrorKind>) -> Result<(), StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        session.set_i32(
            keys::LAST_ERROR,
            code.map_or(ErrorKind::NONE_CODE, ErrorKind::code),
        )
    }

    pub fn network_config(&self) -> Result<NetworkSettings, StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        Ok(NetworkSettings {
            ssid: session.get_str(keys::WIFI_SSID)?,
            password: session.get_str(keys::WIFI_PASSWORD)?,
        })
    }

    pub fn db_config(&self) -> Result<DbSettings, StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        Ok(DbSettings {
            url: session.get_str(keys::DB_URL)?,
            token: session.get_str(keys::DB_TOKEN)?,
            organization: session.get_str(keys::DB_ORGANIZATION)?,
            bucket: session.get_str(keys::DB_BUCKET)?,
        })
    }

    pub fn device_name(&self) -> Result<Option<String>, StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        session.get_str(keys::DEVICE_NAME)
    }

    pub fn last_error_code(&self) -> Result<Option<ErrorKind>, StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        let code = session.get_i32(keys::LAST_ERROR)?;
        Ok(code.and_then(|code| {
            let kind = ErrorKind::from_code(code);
            if kind.is_none() && code != ErrorKind::NONE_CODE {
                warn!("ignoring unknown stored error code {code}");
            }
            kind
        }))
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn reload(&mut self) -> Result<(), StoreError> {
        let mut session = self.storage.open(&self.namespace)?;
        self.configured = session.get_bool(keys::CONFIGURED)?.unwrap_or(false);
        Ok(())
    }

    /// Wipes the whole namespace, including the configured flag and error code.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        {
            let mut session = self.storage.open(&self.namespace)?;
            session.erase_all()?;
        }
        self.configured = false;
        info!("persisted configuration cleared");
        Ok(())
    }

    /// The single write path: empty values never overwrite what is stored.
    fn write_fields(&self, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        if fields.iter().all(|(_, value)| value.is_empty()) {
            return Ok(());
        }

        let mut session = self.storage.open(&self.namespace)?;
        for (key, value) in fields {
            if value.is_empty() {
                continue;
            }
            session.set_str(key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StoredValue {
    Str(String),
    Int(i32),
    Bool(bool),
}

type Namespaces = HashMap<String, HashMap<String, StoredValue>>;

/// Volatile storage backend, handy for tests and simulations.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    namespaces: Arc<Mutex<Namespaces>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemorySession<'a> {
    namespaces: MutexGuard<'a, Namespaces>,
    namespace: String,
}

impl MemorySession<'_> {
    fn get(&self, key: &str) -> Option<&StoredValue> {
        self.namespaces.get(&self.namespace)?.get(key)
    }

    fn put(&mut self, key: &str, value: StoredValue) {
        self.namespaces
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value);
    }
}

impl KeyValueStorage for MemoryStorage {
    type Session<'a> = MemorySession<'a>;

    fn open(&self, namespace: &str) -> Result<Self::Session<'_>, StoreError> {
        let namespaces = self.namespaces.lock().map_err(|_| StoreError::Open {
            namespace: namespace.to_string(),
            message: "storage lock poisoned".to_string(),
        })?;

        Ok(MemorySession {
            namespaces,
            namespace: namespace.to_string(),
        })
    }
}

impl StorageSession for MemorySession<'_> {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Int(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.put(key, StoredValue::Int(value));
        Ok(())
    }

    fn get_bool(&mut self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Bool(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, StoredValue::Bool(value));
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        self.namespaces.remove(&self.namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config() -> PersistedConfig<MemoryStorage> {
        PersistedConfig::new(MemoryStorage::new(), "pref")
    }

    #[test]
    fn network_round_trip_and_blank_password_keeps_previous() {
        let store = config();
        store.write_network_config("home", "secret").unwrap();

        let network = store.network_config().unwrap();
        assert_eq!(network.ssid.as_deref(), Some("home"));
        assert_eq!(network.password.as_deref(), Some("secret"));

        store.write_network_config("home", "").unwrap();
        let network = store.network_config().unwrap();
        assert_eq!(network.password.as_deref(), Some("secret"));
    }

    #[test]
    fn blank_fields_never_overwrite_database_parameters() {
        let store = config();
        store
            .write_db_config("http://influx:8086", "tok", "home", "sensors")
            .unwrap();
        store.write_db_config("", "new-token", "", "").unwrap();

        let db = store.db_config().unwrap();
        assert_eq!(db.url.as_deref(), Some("http://influx:8086"));
        assert_eq!(db.token.as_deref(), Some("new-token"));
        assert_eq!(db.organization.as_deref(), Some("home"));
        assert_eq!(db.bucket.as_deref(), Some("sensors"));
    }

    #[test]
    fn unwritten_fields_read_as_absent() {
        let store = config();
        store.write_device_name("").unwrap();

        assert_eq!(store.device_name().unwrap(), None);
        assert_eq!(store.network_config().unwrap(), NetworkSettings::default());
        assert_eq!(store.db_config().unwrap(), DbSettings::default());
        assert_eq!(store.last_error_code().unwrap(), None);
    }

    #[test]
    fn configured_flag_is_cached_until_reload() {
        let storage = MemoryStorage::new();
        let mut control = PersistedConfig::new(storage.clone(), "pref");
        let mut handler = PersistedConfig::new(storage, "pref");

        assert!(!control.is_configured());
        handler.set_configured(true).unwrap();
        assert!(handler.is_configured());
        assert!(!control.is_configured());

        control.reload().unwrap();
        assert!(control.is_configured());
    }

    #[test]
    fn error_code_is_sticky_until_cleared() {
        let store = config();
        store.set_error_code(Some(ErrorKind::DbConfig)).unwrap();
        assert_eq!(store.last_error_code().unwrap(), Some(ErrorKind::DbConfig));

        store.set_error_code(None).unwrap();
        assert_eq!(store.last_error_code().unwrap(), None);
    }

    #[test]
    fn clear_wipes_everything() {
        let mut store = config();
        store.write_network_config("home", "secret").unwrap();
        store.write_device_name("attic").unwrap();
        store.set_error_code(Some(ErrorKind::WifiConfig)).unwrap();
        store.set_configured(true).unwrap();

        store.clear().unwrap();

        assert!(!store.is_configured());
        store.reload().unwrap();
        assert!(!store.is_configured());
        assert_eq!(store.network_config().unwrap(), NetworkSettings::default());
        assert_eq!(store.device_name().unwrap(), None);
        assert_eq!(store.last_error_code().unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let storage = MemoryStorage::new();
        let mut first = PersistedConfig::new(storage.clone(), "pref");
        let second = PersistedConfig::new(storage, "other");

        second.write_device_name("kept").unwrap();
        first.clear().unwrap();

        assert_eq!(second.device_name().unwrap().as_deref(), Some("kept"));
    }
}

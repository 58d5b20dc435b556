pub mod config;
pub mod connectivity;
pub mod error;
pub mod influx;
pub mod platform;
pub mod portal;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NodeConfig;
pub use connectivity::{ConnectivityManager, WifiLink};
pub use error::{DbError, Error, StoreError};
pub use influx::{FieldValue, TelemetryPoint};
pub use platform::{Board, Clock, Platform};
pub use portal::{
    PortalRequest, PortalResponse, PortalRoutes, PortalServer, ProvisioningPortal,
    CAPTIVE_PROBE_PATHS, FORM_PATH, SUBMIT_PATH,
};
pub use store::{keys, KeyValueStorage, MemoryStorage, PersistedConfig, StorageSession};
pub use supervisor::{RestartReason, Step, Supervisor, SupervisorState};
pub use telemetry::{DbConnector, TelemetryPipeline, TemperatureProbe, TimeSeriesClient, Verdict};
pub use types::{DbEndpoint, DbSettings, ErrorKind, FormScope, NetworkSettings, SensorReading};

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    connectivity::WifiLink,
    portal::PortalServer,
    store::KeyValueStorage,
    telemetry::{DbConnector, TemperatureProbe},
};

/// Time source and blocking delay for the control loop.
pub trait Clock: Clone {
    fn sleep(&mut self, duration: Duration);

    /// Monotonic time since boot.
    fn uptime(&self) -> Duration;

    /// Wall-clock time, once it is trustworthy.
    fn utc_now(&self) -> Option<DateTime<Utc>>;
}

/// Binds the collaborator seams to one concrete target.
pub trait Platform {
    type Storage: KeyValueStorage;
    type Wifi: WifiLink;
    type Server: PortalServer;
    type Probe: TemperatureProbe;
    type Connector: DbConnector;
    type Clock: Clock;
}

/// Everything the supervisor owns for one boot cycle.
pub struct Board<P: Platform> {
    pub storage: P::Storage,
    pub wifi: P::Wifi,
    pub server: P::Server,
    pub probe: P::Probe,
    pub connector: P::Connector,
    pub clock: P::Clock,
    /// Level of the factory-reset input, sampled once at power-up.
    pub factory_reset_requested: bool,
}

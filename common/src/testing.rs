//! In-memory collaborators for exercising the control logic off-target.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    connectivity::WifiLink,
    error::{DbError, Error},
    influx::TelemetryPoint,
    platform::{Board, Clock, Platform},
    portal::{PortalRequest, PortalResponse, PortalRoutes, PortalServer},
    store::MemoryStorage,
    telemetry::{DbConnector, TemperatureProbe, TimeSeriesClient},
    types::{DbEndpoint, SensorReading},
};

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clock whose time only moves when slept on or advanced.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn now(&self) -> Duration {
        *lock(&self.now)
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn sleep(&mut self, duration: Duration) {
        self.advance(duration);
    }

    fn uptime(&self) -> Duration {
        self.now()
    }

    fn utc_now(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Default)]
pub struct WifiState {
    /// Networks in range; only these can be joined.
    pub available: Vec<String>,
    pub joins: Vec<(String, Option<String>)>,
    /// Failed link checks before a pending join comes up.
    pub up_after_polls: u32,
    pub connected: bool,
    pub scans: usize,
    pub access_point: Option<String>,
    /// When set, `begin` records the attempt and then fails with this message.
    pub join_error: Option<String>,
    pending: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeWifi {
    state: Arc<Mutex<WifiState>>,
}

impl FakeWifi {
    pub fn with_networks(networks: &[&str]) -> Self {
        let wifi = Self::default();
        wifi.state().available = networks.iter().map(|ssid| ssid.to_string()).collect();
        wifi
    }

    pub fn state(&self) -> MutexGuard<'_, WifiState> {
        lock(&self.state)
    }
}

impl WifiLink for FakeWifi {
    fn disconnect(&mut self) -> Result<(), Error> {
        let mut state = self.state();
        state.connected = false;
        state.pending = None;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, Error> {
        let mut state = self.state();
        state.scans += 1;
        Ok(state.available.clone())
    }

    fn begin(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error> {
        let mut state = self.state();
        state
            .joins
            .push((ssid.to_string(), password.map(str::to_string)));
        state.connected = false;
        if let Some(message) = state.join_error.clone() {
            state.pending = None;
            return Err(Error::Wifi(message));
        }
        state.pending = state
            .available
            .iter()
            .any(|candidate| candidate == ssid)
            .then_some(0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let mut state = self.state();
        if state.connected {
            return true;
        }
        match state.pending {
            Some(checks) if checks >= state.up_after_polls => {
                state.pending = None;
                state.connected = true;
                true
            }
            Some(checks) => {
                state.pending = Some(checks + 1);
                false
            }
            None => false,
        }
    }

    fn rssi(&self) -> Option<i32> {
        self.state().connected.then_some(-55)
    }

    fn start_access_point(&mut self, ssid: &str, _password: Option<&str>) -> Result<(), Error> {
        self.state().access_point = Some(ssid.to_string());
        Ok(())
    }
}

/// Server that dispatches requests synchronously from the test body.
#[derive(Clone, Default)]
pub struct FakeServer {
    routes: Arc<Mutex<Option<Arc<dyn PortalRoutes>>>>,
    serviced: Arc<Mutex<usize>>,
}

impl FakeServer {
    pub fn request(&self, request: PortalRequest<'_>) -> Option<PortalResponse> {
        let routes = lock(&self.routes).clone()?;
        Some(routes.handle(request))
    }

    pub fn serviced(&self) -> usize {
        *lock(&self.serviced)
    }
}

impl PortalServer for FakeServer {
    fn serve(&mut self, routes: Arc<dyn PortalRoutes>) -> Result<(), Error> {
        *lock(&self.routes) = Some(routes);
        Ok(())
    }

    fn service(&mut self) {
        *lock(&self.serviced) += 1;
    }
}

/// Replays readings in order, then repeats the last one.
#[derive(Debug)]
pub struct ScriptedProbe {
    readings: VecDeque<f32>,
    last: SensorReading,
}

impl ScriptedProbe {
    pub fn new(readings: &[f32]) -> Self {
        Self {
            readings: readings.iter().copied().collect(),
            last: SensorReading::celsius(20.0),
        }
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl TemperatureProbe for ScriptedProbe {
    fn request_temperature(&mut self) {
        if let Some(next) = self.readings.pop_front() {
            self.last = SensorReading(next);
        }
    }

    fn temperature(&mut self) -> SensorReading {
        self.last
    }
}

#[derive(Debug)]
pub struct ConnectorState {
    pub validation: Result<(), DbError>,
    pub write: Result<(), DbError>,
    pub endpoints: Vec<DbEndpoint>,
    pub written: Vec<TelemetryPoint>,
    /// Write calls, successful or not.
    pub attempts: usize,
}

impl Default for ConnectorState {
    fn default() -> Self {
        Self {
            validation: Ok(()),
            write: Ok(()),
            endpoints: Vec::new(),
            written: Vec::new(),
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn state(&self) -> MutexGuard<'_, ConnectorState> {
        lock(&self.state)
    }
}

impl DbConnector for FakeConnector {
    type Client = FakeClient;

    fn connect(&self, endpoint: &DbEndpoint) -> Result<Self::Client, DbError> {
        self.state().endpoints.push(endpoint.clone());
        Ok(FakeClient {
            state: self.state.clone(),
        })
    }
}

#[derive(Debug)]
pub struct FakeClient {
    state: Arc<Mutex<ConnectorState>>,
}

impl TimeSeriesClient for FakeClient {
    fn validate_connection(&mut self) -> Result<(), DbError> {
        lock(&self.state).validation.clone()
    }

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        state.write.clone()?;
        state.written.push(point.clone());
        Ok(())
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Storage = MemoryStorage;
    type Wifi = FakeWifi;
    type Server = FakeServer;
    type Probe = ScriptedProbe;
    type Connector = FakeConnector;
    type Clock = ManualClock;
}

pub fn test_board(networks: &[&str], readings: &[f32]) -> Board<TestPlatform> {
    Board {
        storage: MemoryStorage::new(),
        wifi: FakeWifi::with_networks(networks),
        server: FakeServer::default(),
        probe: ScriptedProbe::new(readings),
        connector: FakeConnector::default(),
        clock: ManualClock::default(),
        factory_reset_requested: false,
    }
}

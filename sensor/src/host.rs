use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{info, warn};

use transmitter_common::{
    influx, Board, Clock, DbConnector, DbEndpoint, DbError, Error, KeyValueStorage, NodeConfig,
    Platform, PortalRequest, PortalResponse, PortalRoutes, PortalServer, SensorReading, Step,
    StorageSession, StoreError, Supervisor, SupervisorState, TelemetryPoint, TemperatureProbe,
    TimeSeriesClient, WifiLink, CAPTIVE_PROBE_PATHS, FORM_PATH, SUBMIT_PATH,
};

const DEFAULT_SIM_NETWORKS: &str = "home,office,cafe";
const SIMULATED_RSSI: i32 = -55;
const PORTAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PORTAL_BIND_ATTEMPTS: u32 = 20;
const PORTAL_BIND_RETRY: Duration = Duration::from_millis(100);
const INFLUX_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = load_settings();

    let data_dir = std::env::var("TRANSMITTER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.transmitter"));
    let storage = FileStorage::open(data_dir.join("nvs.json"))
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;

    let portal_addr: SocketAddr = std::env::var("TRANSMITTER_PORTAL_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("TRANSMITTER_PORTAL_ADDR is not a socket address")?;

    let networks: Vec<String> = std::env::var("TRANSMITTER_SIM_NETWORKS")
        .unwrap_or_else(|_| DEFAULT_SIM_NETWORKS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|ssid| !ssid.is_empty())
        .map(str::to_string)
        .collect();

    let factory_reset = std::env::var("TRANSMITTER_FACTORY_RESET").is_ok_and(|value| value == "1");
    let handle = Handle::current();

    info!(
        "simulated transmitter starting (store: {}, portal: http://{portal_addr})",
        data_dir.display()
    );

    tokio::task::spawn_blocking(move || {
        control_loop(settings, storage, portal_addr, networks, factory_reset, handle)
    })
    .await
    .context("control loop panicked")?
}

fn load_settings() -> NodeConfig {
    let mut settings = match std::env::var("TRANSMITTER_CONFIG") {
        Ok(path) => read_settings(Path::new(&path)).unwrap_or_else(|err| {
            warn!("failed to load settings from {path}: {err:#}");
            NodeConfig::default()
        }),
        Err(_) => NodeConfig::default(),
    };
    settings.sanitize();
    settings
}

fn read_settings(path: &Path) -> anyhow::Result<NodeConfig> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice::<NodeConfig>(&raw)?)
}

/// Each pass of the outer loop is one simulated power cycle.
fn control_loop(
    settings: NodeConfig,
    storage: FileStorage,
    portal_addr: SocketAddr,
    networks: Vec<String>,
    mut factory_reset: bool,
    handle: Handle,
) -> anyhow::Result<()> {
    let started = Instant::now();

    loop {
        let board = Board::<HostPlatform> {
            storage: storage.clone(),
            wifi: SimulatedWifi::new(networks.clone()),
            server: HttpPortalServer::new(handle.clone(), portal_addr),
            probe: SimulatedProbe::default(),
            connector: HttpInfluxConnector::new(INFLUX_TIMEOUT),
            clock: SystemClock::new(started),
            factory_reset_requested: std::mem::take(&mut factory_reset),
        };
        let mut supervisor = Supervisor::new(settings.clone(), board);

        loop {
            match supervisor.tick() {
                Ok(Step::Continue) => {}
                Ok(Step::Restart(reason)) => {
                    info!("device reset requested ({reason:?})");
                    break;
                }
                Err(err) => {
                    warn!("control loop failed in {}: {err}; resetting", supervisor.state().as_str());
                    thread::sleep(settings.restart_delay());
                    break;
                }
            }

            if supervisor.state() == SupervisorState::Provisioning {
                thread::sleep(PORTAL_POLL_INTERVAL);
            }
        }
    }
}

pub struct HostPlatform;

impl Platform for HostPlatform {
    type Storage = FileStorage;
    type Wifi = SimulatedWifi;
    type Server = HttpPortalServer;
    type Probe = SimulatedProbe;
    type Connector = HttpInfluxConnector;
    type Clock = SystemClock;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Bool(bool),
    Int(i32),
    Str(String),
}

type Namespaces = BTreeMap<String, BTreeMap<String, StoredValue>>;

/// Key/value store persisted as one JSON document, rewritten on every change.
#[derive(Clone)]
pub struct FileStorage {
    path: Arc<PathBuf>,
    namespaces: Arc<Mutex<Namespaces>>,
}

impl FileStorage {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let namespaces = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Namespaces>(&raw)
                .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?,
            Err(err) if err.kind() == ErrorKind::NotFound => Namespaces::new(),
            Err(err) => {
                return Err(StoreError::Backend(format!("{}: {err}", path.display())));
            }
        };

        Ok(Self {
            path: Arc::new(path),
            namespaces: Arc::new(Mutex::new(namespaces)),
        })
    }
}

pub struct FileSession<'a> {
    namespaces: MutexGuard<'a, Namespaces>,
    namespace: String,
    path: &'a Path,
}

impl FileSession<'_> {
    fn get(&self, key: &str) -> Option<&StoredValue> {
        self.namespaces.get(&self.namespace)?.get(key)
    }

    fn put(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.namespaces
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value);
        self.flush()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let backend = |err: std::io::Error| StoreError::Backend(format!("{}: {err}", self.path.display()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(backend)?;
        }
        let payload = serde_json::to_vec_pretty(&*self.namespaces)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload).map_err(backend)?;
        std::fs::rename(&staging, self.path).map_err(backend)
    }
}

impl KeyValueStorage for FileStorage {
    type Session<'a> = FileSession<'a>;

    fn open(&self, namespace: &str) -> Result<Self::Session<'_>, StoreError> {
        let namespaces = self.namespaces.lock().map_err(|_| StoreError::Open {
            namespace: namespace.to_string(),
            message: "store lock poisoned".to_string(),
        })?;

        Ok(FileSession {
            namespaces,
            namespace: namespace.to_string(),
            path: self.path.as_path(),
        })
    }
}

impl StorageSession for FileSession<'_> {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Str(value.to_string()))
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Int(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.put(key, StoredValue::Int(value))
    }

    fn get_bool(&mut self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(match self.get(key) {
            Some(StoredValue::Bool(value)) => Some(*value),
            _ => None,
        })
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, StoredValue::Bool(value))
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        if self.namespaces.remove(&self.namespace).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Radio stand-in: joins succeed for any network in the configured list.
pub struct SimulatedWifi {
    networks: Vec<String>,
    connected: bool,
}

impl SimulatedWifi {
    pub fn new(networks: Vec<String>) -> Self {
        Self {
            networks,
            connected: false,
        }
    }
}

impl WifiLink for SimulatedWifi {
    fn disconnect(&mut self) -> Result<(), Error> {
        self.connected = false;
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, Error> {
        Ok(self.networks.clone())
    }

    fn begin(&mut self, ssid: &str, _password: Option<&str>) -> Result<(), Error> {
        self.connected = self.networks.iter().any(|candidate| candidate == ssid);
        if !self.connected {
            warn!("simulated network `{ssid}` is out of range");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn rssi(&self) -> Option<i32> {
        self.connected.then_some(SIMULATED_RSSI)
    }

    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error> {
        self.connected = false;
        info!(
            "simulated access point `{ssid}` up ({})",
            if password.is_some() { "WPA2" } else { "open" }
        );
        Ok(())
    }
}

/// Serves the provisioning routes with axum on the shared tokio runtime.
pub struct HttpPortalServer {
    handle: Handle,
    addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl HttpPortalServer {
    pub fn new(handle: Handle, addr: SocketAddr) -> Self {
        Self {
            handle,
            addr,
            local_addr: None,
            task: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The previous boot's listener is released asynchronously, so the port
    /// may still be taken for a moment.
    fn bind(&self) -> Result<std::net::TcpListener, Error> {
        let mut attempt = 1;
        loop {
            match std::net::TcpListener::bind(self.addr) {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == ErrorKind::AddrInUse && attempt < PORTAL_BIND_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(PORTAL_BIND_RETRY);
                }
                Err(err) => {
                    return Err(Error::Server(format!("failed to bind {}: {err}", self.addr)));
                }
            }
        }
    }
}

impl PortalServer for HttpPortalServer {
    fn serve(&mut self, routes: Arc<dyn PortalRoutes>) -> Result<(), Error> {
        let std_listener = self.bind()?;
        std_listener
            .set_nonblocking(true)
            .map_err(|err| Error::Server(err.to_string()))?;
        self.local_addr = std_listener.local_addr().ok();

        let listener = {
            let _runtime = self.handle.enter();
            tokio::net::TcpListener::from_std(std_listener)
                .map_err(|err| Error::Server(err.to_string()))?
        };

        let mut app = Router::new().route(FORM_PATH, get(handle_form));
        for path in CAPTIVE_PROBE_PATHS {
            app = app.route(path, get(handle_form));
        }
        let app = app.route(SUBMIT_PATH, get(handle_submit)).with_state(routes);

        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        self.task = Some(self.handle.spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("portal server stopped: {err}");
            }
        }));

        info!(
            "provisioning portal listening on http://{}",
            self.local_addr.unwrap_or(self.addr)
        );
        Ok(())
    }
}

impl Drop for HttpPortalServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_form(State(routes): State<Arc<dyn PortalRoutes>>) -> Response {
    into_http(routes.handle(PortalRequest::Form))
}

async fn handle_submit(
    State(routes): State<Arc<dyn PortalRoutes>>,
    RawQuery(query): RawQuery,
) -> Response {
    into_http(routes.handle(PortalRequest::Submit(query.as_deref().unwrap_or_default())))
}

fn into_http(response: PortalResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

/// Slowly cycling readings around room temperature.
#[derive(Debug, Default)]
pub struct SimulatedProbe {
    tick: u64,
}

impl TemperatureProbe for SimulatedProbe {
    fn request_temperature(&mut self) {
        self.tick = self.tick.saturating_add(1);
    }

    fn temperature(&mut self) -> SensorReading {
        SensorReading::celsius(20.0 + ((self.tick % 8) as f32 * 0.1))
    }
}

#[derive(Debug, Clone)]
pub struct HttpInfluxConnector {
    timeout: Duration,
}

impl HttpInfluxConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DbConnector for HttpInfluxConnector {
    type Client = HttpInfluxClient;

    fn connect(&self, endpoint: &DbEndpoint) -> Result<Self::Client, DbError> {
        let write_url = influx::write_url(endpoint)?.to_string();
        let buckets_url = influx::buckets_url(endpoint)?.to_string();

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(HttpInfluxClient {
            agent,
            endpoint: endpoint.clone(),
            write_url,
            buckets_url,
            authorization: influx::authorization(endpoint),
        })
    }
}

pub struct HttpInfluxClient {
    agent: ureq::Agent,
    endpoint: DbEndpoint,
    write_url: String,
    buckets_url: String,
    authorization: String,
}

fn transport(err: ureq::Error) -> DbError {
    DbError::Transport(err.to_string())
}

impl TimeSeriesClient for HttpInfluxClient {
    fn validate_connection(&mut self) -> Result<(), DbError> {
        let mut response = self
            .agent
            .get(self.buckets_url.as_str())
            .header("Authorization", self.authorization.as_str())
            .header("Accept", "application/json")
            .call()
            .map_err(transport)?;

        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string().unwrap_or_default();
        influx::check_validation_response(&self.endpoint, status, &body)
    }

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), DbError> {
        let mut response = self
            .agent
            .post(self.write_url.as_str())
            .header("Authorization", self.authorization.as_str())
            .header("Content-Type", "text/plain; charset=utf-8")
            .send(point.to_line_protocol())
            .map_err(transport)?;

        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string().unwrap_or_default();
        influx::check_write_response(status, &body)
    }
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new(started: Instant) -> Self {
        Self { started }
    }
}

impl Clock for SystemClock {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn utc_now(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }
}

use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use transmitter_common::{
    influx, keys, Board, Clock, DbConnector, DbEndpoint, DbError, Error, KeyValueStorage,
    NodeConfig, Platform, PortalRequest, PortalResponse, PortalRoutes, PortalServer,
    RestartReason, SensorReading, Step, StorageSession, StoreError, Supervisor, SupervisorState,
    TelemetryPoint, TemperatureProbe, TimeSeriesClient, WifiLink, CAPTIVE_PROBE_PATHS, FORM_PATH,
    SUBMIT_PATH,
};

const DS18B20_PIN: i32 = 15;
const FACTORY_RESET_PIN: i32 = 4;

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WATCHDOG_FEED_INTERVAL: Duration = Duration::from_secs(1);
const FACTORY_RESET_DELAY: Duration = Duration::from_secs(5);
const PORTAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const INFLUX_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_BODY: usize = 2048;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut settings = NodeConfig::default();
    settings.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let factory_reset_requested = {
        let mut reset_pin = PinDriver::input(pins.gpio4)?;
        reset_pin.set_pull(Pull::Down)?;
        reset_pin.is_high()
    };
    if factory_reset_requested {
        warn!("factory reset pin GPIO{FACTORY_RESET_PIN} held high");
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let probe = Ds18b20Probe::new(pins.gpio15.downgrade())
        .context("failed to initialize temperature probe")?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let sntp = match EspSntp::new_default() {
        Ok(sntp) => Some(Arc::new(sntp)),
        Err(err) => {
            warn!("sntp unavailable, points will be sent without timestamps: {err:?}");
            None
        }
    };

    let board = Board::<EspPlatform> {
        storage: NvsStorage::new(nvs_partition),
        wifi: EspWifiLink { wifi },
        server: EspPortalServer::default(),
        probe,
        connector: EspInfluxConnector,
        clock: EspClock::new(sntp),
        factory_reset_requested,
    };
    let mut supervisor = Supervisor::new(settings, board);

    loop {
        feed_watchdog();

        match supervisor.tick() {
            Ok(Step::Continue) => {}
            Ok(Step::Restart(reason)) => restart(reason),
            Err(err) => {
                warn!("control loop failed in {}: {err}", supervisor.state().as_str());
                restart_now();
            }
        }

        if supervisor.state() == SupervisorState::Provisioning {
            thread::sleep(PORTAL_POLL_INTERVAL);
        }
    }
}

fn restart(reason: RestartReason) {
    if reason == RestartReason::FactoryReset {
        info!(
            "configuration wiped; restarting in {}s",
            FACTORY_RESET_DELAY.as_secs()
        );
        sleep_feeding_watchdog(FACTORY_RESET_DELAY);
    } else {
        info!("restarting ({reason:?})");
    }
    restart_now();
}

fn restart_now() {
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

struct EspPlatform;

impl Platform for EspPlatform {
    type Storage = NvsStorage;
    type Wifi = EspWifiLink;
    type Server = EspPortalServer;
    type Probe = Ds18b20Probe;
    type Connector = EspInfluxConnector;
    type Clock = EspClock;
}

/// NVS partition shared by the control loop and the portal handler task.
/// The lock serialises namespace handles across both.
#[derive(Clone)]
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

// Field order matters: the handle closes before the lock is released.
struct NvsSession<'a> {
    nvs: EspNvs<NvsDefault>,
    _guard: MutexGuard<'a, ()>,
}

fn nvs_err(err: esp_idf_svc::sys::EspError) -> StoreError {
    StoreError::Backend(format!("{err:?}"))
}

impl KeyValueStorage for NvsStorage {
    type Session<'a> = NvsSession<'a>;

    fn open(&self, namespace: &str) -> Result<Self::Session<'_>, StoreError> {
        let guard = self.lock.lock().map_err(|_| StoreError::Open {
            namespace: namespace.to_string(),
            message: "nvs lock poisoned".to_string(),
        })?;
        let nvs = EspNvs::new(self.partition.clone(), namespace, true).map_err(|err| {
            StoreError::Open {
                namespace: namespace.to_string(),
                message: format!("{err:?}"),
            }
        })?;

        Ok(NvsSession { nvs, _guard: guard })
    }
}

impl StorageSession for NvsSession<'_> {
    fn get_str(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(len) = self.nvs.str_len(key).map_err(nvs_err)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len.max(1)];
        Ok(self
            .nvs
            .get_str(key, &mut buffer)
            .map_err(nvs_err)?
            .map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value).map_err(nvs_err)
    }

    fn get_i32(&mut self, key: &str) -> Result<Option<i32>, StoreError> {
        self.nvs.get_i32(key).map_err(nvs_err)
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.nvs.set_i32(key, value).map_err(nvs_err)
    }

    fn get_bool(&mut self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.nvs.get_u8(key).map_err(nvs_err)?.map(|value| value != 0))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.nvs.set_u8(key, u8::from(value)).map_err(nvs_err)
    }

    fn erase_all(&mut self) -> Result<(), StoreError> {
        for key in keys::ALL {
            self.nvs.remove(key).map_err(nvs_err)?;
        }
        Ok(())
    }
}

struct EspWifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

fn wifi_err(err: esp_idf_svc::sys::EspError) -> Error {
    Error::Wifi(format!("{err:?}"))
}

impl EspWifiLink {
    fn ensure_station_started(&mut self) -> Result<(), Error> {
        if !self.wifi.is_started().map_err(wifi_err)? {
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration::default()))
                .map_err(wifi_err)?;
            self.wifi.start().map_err(wifi_err)?;
        }
        Ok(())
    }
}

impl WifiLink for EspWifiLink {
    fn disconnect(&mut self) -> Result<(), Error> {
        if self.wifi.is_connected().map_err(wifi_err)? {
            self.wifi.disconnect().map_err(wifi_err)?;
        }
        Ok(())
    }

    fn scan(&mut self) -> Result<Vec<String>, Error> {
        self.ensure_station_started()?;

        let mut found = self.wifi.scan().map_err(wifi_err)?;
        found.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));

        let mut networks: Vec<String> = Vec::with_capacity(found.len());
        for access_point in found {
            let ssid = access_point.ssid.as_str();
            if !ssid.is_empty() && !networks.iter().any(|known| known == ssid) {
                networks.push(ssid.to_string());
            }
        }
        Ok(networks)
    }

    fn begin(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error> {
        let auth_method = if password.is_some() {
            AuthMethod::WPAWPA2Personal
        } else {
            AuthMethod::None
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| Error::Wifi("wifi ssid too long".to_string()))?,
                password: password
                    .unwrap_or_default()
                    .try_into()
                    .map_err(|_| Error::Wifi("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(wifi_err)?;

        if !self.wifi.is_started().map_err(wifi_err)? {
            self.wifi.start().map_err(wifi_err)?;
        }
        self.wifi.wifi_mut().connect().map_err(wifi_err)
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn rssi(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(ap_info.rssi))
    }

    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error> {
        if self.wifi.is_started().map_err(wifi_err)? {
            if let Err(err) = self.wifi.stop() {
                warn!("failed to stop wifi before access point mode: {err}");
            }
        }

        let auth_method = if password.is_some() {
            AuthMethod::WPA2Personal
        } else {
            AuthMethod::None
        };
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| Error::Wifi("access point ssid too long".to_string()))?,
                password: password
                    .unwrap_or_default()
                    .try_into()
                    .map_err(|_| Error::Wifi("access point password too long".to_string()))?,
                auth_method,
                channel: 1,
                ..Default::default()
            }))
            .map_err(wifi_err)?;
        self.wifi.start().map_err(wifi_err)?;
        self.wifi.wait_netif_up().map_err(wifi_err)?;

        info!("access point `{ssid}` started");
        Ok(())
    }
}

#[derive(Default)]
struct EspPortalServer {
    server: Option<EspHttpServer<'static>>,
}

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

fn write_portal_response(req: HttpRequest<'_, '_>, response: PortalResponse) -> anyhow::Result<()> {
    req.into_response(
        response.status,
        None,
        &[("Content-Type", response.content_type)],
    )?
    .write_all(response.body.as_bytes())?;
    Ok(())
}

impl EspPortalServer {
    fn start(&mut self, routes: Arc<dyn PortalRoutes>) -> anyhow::Result<()> {
        let conf = HttpConfiguration {
            stack_size: 16 * 1024,
            ..Default::default()
        };

        let mut server = EspHttpServer::new(&conf)?;

        for path in std::iter::once(FORM_PATH).chain(CAPTIVE_PROBE_PATHS) {
            let routes = routes.clone();
            server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
                write_portal_response(req, routes.handle(PortalRequest::Form))
            })?;
        }

        server.fn_handler::<anyhow::Error, _>(SUBMIT_PATH, Method::Get, move |req| {
            let query = req
                .uri()
                .split_once('?')
                .map(|(_, query)| query.to_string())
                .unwrap_or_default();
            write_portal_response(req, routes.handle(PortalRequest::Submit(&query)))
        })?;

        self.server = Some(server);
        Ok(())
    }
}

impl PortalServer for EspPortalServer {
    fn serve(&mut self, routes: Arc<dyn PortalRoutes>) -> Result<(), Error> {
        self.start(routes)
            .map_err(|err| Error::Server(format!("{err:#}")))
    }
}

struct Ds18b20Probe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    delay: Ets,
    latest: SensorReading,
}

impl Ds18b20Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            delay: Ets,
            latest: SensorReading::DISCONNECTED,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn refresh_address(&mut self) {
        let mut first: Option<Address> = None;
        let mut device_count = 0_u32;

        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) => {
                    device_count = device_count.saturating_add(1);
                    if first.is_none() && address.family_code() == ds18b20::FAMILY_CODE {
                        first = Some(address);
                    }
                }
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.address = first;
        match self.address {
            Some(address) => info!(
                "DS18B20 ready on GPIO{DS18B20_PIN} ({device_count} one-wire device(s), using {address:?})"
            ),
            None => warn!(
                "no DS18B20 found on GPIO{DS18B20_PIN} ({device_count} one-wire device(s) detected)"
            ),
        }
    }

    fn convert(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

impl TemperatureProbe for Ds18b20Probe {
    fn request_temperature(&mut self) {
        self.latest = self
            .convert()
            .map_or(SensorReading::DISCONNECTED, SensorReading::celsius);
    }

    fn temperature(&mut self) -> SensorReading {
        self.latest
    }
}

struct EspInfluxConnector;

impl DbConnector for EspInfluxConnector {
    type Client = EspInfluxClient;

    fn connect(&self, endpoint: &DbEndpoint) -> Result<Self::Client, DbError> {
        let write_url = influx::write_url(endpoint)?.to_string();
        let buckets_url = influx::buckets_url(endpoint)?.to_string();

        let http_conf = HttpClientConfiguration {
            timeout: Some(INFLUX_TIMEOUT),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(transport)?;

        Ok(EspInfluxClient {
            client: HttpClient::wrap(connection),
            endpoint: endpoint.clone(),
            write_url,
            buckets_url,
            authorization: influx::authorization(endpoint),
        })
    }
}

struct EspInfluxClient {
    client: HttpClient<EspHttpConnection>,
    endpoint: DbEndpoint,
    write_url: String,
    buckets_url: String,
    authorization: String,
}

fn transport<E: core::fmt::Debug>(err: E) -> DbError {
    DbError::Transport(format!("{err:?}"))
}

impl EspInfluxClient {
    /// Returns the status and at most [`MAX_RESPONSE_BODY`] bytes of the body.
    fn exchange(&mut self, method: Method, url: &str, body: Option<&[u8]>) -> Result<(u16, String), DbError> {
        let content_length = body.map(|body| body.len().to_string());
        let mut headers = vec![
            ("Authorization", self.authorization.as_str()),
            ("Accept", "application/json"),
        ];
        if let Some(len) = content_length.as_deref() {
            headers.push(("Content-Type", "text/plain; charset=utf-8"));
            headers.push(("Content-Length", len));
        }

        let mut request = self.client.request(method, url, &headers).map_err(transport)?;
        if let Some(body) = body {
            request.write_all(body).map_err(transport)?;
            request.flush().map_err(transport)?;
        }
        let mut response = request.submit().map_err(transport)?;
        let status = response.status();

        let mut raw = Vec::new();
        let mut chunk = [0_u8; 256];
        loop {
            let read = response.read(&mut chunk).map_err(transport)?;
            if read == 0 {
                break;
            }
            let room = MAX_RESPONSE_BODY.saturating_sub(raw.len());
            raw.extend_from_slice(&chunk[..read.min(room)]);
        }

        Ok((status, String::from_utf8_lossy(&raw).into_owned()))
    }
}

impl TimeSeriesClient for EspInfluxClient {
    fn validate_connection(&mut self) -> Result<(), DbError> {
        let url = self.buckets_url.clone();
        let (status, body) = self.exchange(Method::Get, &url, None)?;
        influx::check_validation_response(&self.endpoint, status, &body)
    }

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), DbError> {
        let url = self.write_url.clone();
        let line = point.to_line_protocol();
        let (status, body) = self.exchange(Method::Post, &url, Some(line.as_bytes()))?;
        influx::check_write_response(status, &body)
    }
}

#[derive(Clone)]
struct EspClock {
    started: Instant,
    sntp: Option<Arc<EspSntp<'static>>>,
}

impl EspClock {
    fn new(sntp: Option<Arc<EspSntp<'static>>>) -> Self {
        Self {
            started: Instant::now(),
            sntp,
        }
    }
}

impl Clock for EspClock {
    fn sleep(&mut self, duration: Duration) {
        sleep_feeding_watchdog(duration);
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn utc_now(&self) -> Option<DateTime<Utc>> {
        self.sntp
            .as_ref()
            .filter(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
            .map(|_| Utc::now())
    }
}

fn sleep_feeding_watchdog(duration: Duration) {
    let mut remaining = duration;
    while !remaining.is_zero() {
        let step = remaining.min(WATCHDOG_FEED_INTERVAL);
        thread::sleep(step);
        feed_watchdog();
        remaining -= step;
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

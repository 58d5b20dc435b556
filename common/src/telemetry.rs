use std::time::Duration;

use log::{info, warn};

use crate::{
    connectivity::{ConnectivityManager, WifiLink},
    error::{DbError, Error},
    influx::{FieldValue, TelemetryPoint, FIELD_RSSI, FIELD_TEMPERATURE, TAG_DEVICE, TAG_NETWORK},
    platform::Clock,
    store::{KeyValueStorage, PersistedConfig},
    types::{DbEndpoint, ErrorKind, SensorReading},
};

/// Single temperature probe on the sensor bus.
pub trait TemperatureProbe {
    /// Starts a conversion and waits for it to complete.
    fn request_temperature(&mut self);

    /// Latest conversion result; [`SensorReading::DISCONNECTED`] when nothing answers.
    fn temperature(&mut self) -> SensorReading;
}

pub trait TimeSeriesClient {
    /// Checks that the endpoint accepts the configured parameters.
    fn validate_connection(&mut self) -> Result<(), DbError>;

    fn write_point(&mut self, point: &TelemetryPoint) -> Result<(), DbError>;
}

/// Builds a client for a validated set of endpoint parameters.
pub trait DbConnector {
    type Client: TimeSeriesClient;

    fn connect(&self, endpoint: &DbEndpoint) -> Result<Self::Client, DbError>;
}

/// Outcome of boot-time validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ready,
    Fatal(ErrorKind),
}

struct Session<T> {
    client: T,
    device_name: String,
    network: String,
}

pub struct TelemetryPipeline<P, D: DbConnector, C> {
    probe: P,
    connector: D,
    clock: C,
    cycles: u32,
    sample_interval: Duration,
    device_model: String,
    default_device_name: String,
    session: Option<Session<D::Client>>,
}

impl<P, D, C> TelemetryPipeline<P, D, C>
where
    P: TemperatureProbe,
    D: DbConnector,
    C: Clock,
{
    pub fn new(
        probe: P,
        connector: D,
        clock: C,
        cycles: u32,
        sample_interval: Duration,
        device_model: impl Into<String>,
        default_device_name: impl Into<String>,
    ) -> Self {
        Self {
            probe,
            connector,
            clock,
            cycles: cycles.max(1),
            sample_interval,
            device_model: device_model.into(),
            default_device_name: default_device_name.into(),
            session: None,
        }
    }

    /// Checks the stored parameters, joins the network and probes the
    /// database endpoint. Any [`Verdict::Fatal`] leaves the pipeline unusable.
    pub fn validate<S, W, LC>(
        &mut self,
        store: &PersistedConfig<S>,
        link: &mut ConnectivityManager<W, LC>,
    ) -> Result<Verdict, Error>
    where
        S: KeyValueStorage,
        W: WifiLink,
        LC: Clock,
    {
        self.session = None;

        let network = store.network_config()?;
        let Some(ssid) = network.ssid.filter(|ssid| !ssid.trim().is_empty()) else {
            warn!("[telemetry] no ssid stored");
            return Ok(Verdict::Fatal(ErrorKind::WifiConfig));
        };
        let password = network.password.unwrap_or_default();

        let Some(endpoint) = store.db_config()?.endpoint() else {
            warn!("[telemetry] influx parameters incomplete");
            return Ok(Verdict::Fatal(ErrorKind::DbConfig));
        };

        let device_name = store
            .device_name()?
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.default_device_name.clone());

        info!("[telemetry] ssid: {ssid}");
        info!("[telemetry] influx url: {}", endpoint.url);
        info!("[telemetry] influx organisation: {}", endpoint.organization);
        info!("[telemetry] influx bucket: {}", endpoint.bucket);
        info!("[telemetry] device name: {device_name}");

        link.set_credentials(&ssid, &password);
        match link.connect() {
            Ok(true) => {}
            Ok(false) => {
                warn!("[telemetry] wifi connection could not be established");
                return Ok(Verdict::Fatal(ErrorKind::WifiConfig));
            }
            Err(err) => {
                warn!("[telemetry] radio refused the stored credentials: {err}");
                return Ok(Verdict::Fatal(ErrorKind::WifiConfig));
            }
        }

        let mut client = match self.connector.connect(&endpoint) {
            Ok(client) => client,
            Err(err) => {
                warn!("[telemetry] influx client rejected parameters: {err}");
                return Ok(Verdict::Fatal(ErrorKind::DbConfig));
            }
        };

        match client.validate_connection() {
            Ok(()) => info!("[telemetry] connected to influx at {}", endpoint.url),
            Err(err) if err.is_invalid_parameters() => {
                warn!("[telemetry] influx connection failed: {err}");
                return Ok(Verdict::Fatal(ErrorKind::DbConfig));
            }
            Err(err) => warn!("[telemetry] influx connection check inconclusive, continuing: {err}"),
        }

        self.session = Some(Session {
            client,
            device_name,
            network: ssid,
        });
        Ok(Verdict::Ready)
    }

    /// Mean over exactly `cycles` consecutive valid readings. A disconnected
    /// probe throws the batch away and starts over.
    pub fn measure(&mut self) -> f64 {
        let mut sum = 0.0_f64;
        let mut taken = 0_u32;

        while taken < self.cycles {
            self.probe.request_temperature();
            let reading = self.probe.temperature();

            if reading.is_disconnected() {
                warn!("[telemetry] no sensor connected; restarting sample batch");
                sum = 0.0;
                taken = 0;
            } else {
                sum += f64::from(reading.value());
                taken += 1;
            }

            self.clock.sleep(self.sample_interval);
        }

        let average = sum / f64::from(self.cycles);
        info!(
            "[telemetry] measured temperature {average:.2}°C over {} cycles",
            self.cycles
        );
        average
    }

    /// One steady-state tick: sample, package and transmit. Transmission
    /// failures are logged and tolerated.
    pub fn sample_and_send<W, LC>(
        &mut self,
        link: &mut ConnectivityManager<W, LC>,
    ) -> Result<(), Error>
    where
        W: WifiLink,
        LC: Clock,
    {
        if self.session.is_none() {
            return Err(Error::NotValidated);
        }

        let average = self.measure();
        let point = self.build_point(average, link.rssi());
        info!("[telemetry] writing: {}", point.to_line_protocol());

        if !link.is_connected() {
            warn!("[telemetry] wifi down; reconnecting once");
            match link.connect() {
                Ok(true) => {}
                Ok(false) => warn!("[telemetry] no wifi connection"),
                Err(err) => warn!("[telemetry] reconnect failed: {err}"),
            }
        }

        let session = self.session.as_mut().ok_or(Error::NotValidated)?;
        if let Err(err) = session.client.write_point(&point) {
            warn!("[telemetry] influx write failed: {err}");
        }
        Ok(())
    }

    fn build_point(&self, average: f64, rssi: Option<i32>) -> TelemetryPoint {
        let (device_name, network) = self
            .session
            .as_ref()
            .map(|session| (session.device_name.as_str(), session.network.as_str()))
            .unwrap_or((self.default_device_name.as_str(), ""));

        let mut point = TelemetryPoint::new(device_name);
        point
            .add_tag(TAG_DEVICE, &self.device_model)
            .add_tag(TAG_NETWORK, network);
        if let Some(rssi) = rssi {
            point.add_field(FIELD_RSSI, FieldValue::Integer(i64::from(rssi)));
        }
        point
            .add_field(FIELD_TEMPERATURE, FieldValue::Float(average))
            .set_timestamp(self.clock.utc_now());
        point
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        store::MemoryStorage,
        testing::{FakeConnector, FakeWifi, ManualClock, ScriptedProbe},
    };

    type Pipeline = TelemetryPipeline<ScriptedProbe, FakeConnector, ManualClock>;

    fn pipeline(probe: ScriptedProbe, connector: FakeConnector, cycles: u32) -> Pipeline {
        TelemetryPipeline::new(
            probe,
            connector,
            ManualClock::default(),
            cycles,
            Duration::from_secs(1),
            "ESP32",
            "Temperature_Transmitter",
        )
    }

    fn link(wifi: FakeWifi) -> ConnectivityManager<FakeWifi, ManualClock> {
        ConnectivityManager::new(wifi, ManualClock::default(), Duration::from_millis(500), Some(4))
    }

    fn configured_store() -> PersistedConfig<MemoryStorage> {
        let store = PersistedConfig::new(MemoryStorage::new(), "pref");
        store.write_network_config("home", "secret").unwrap();
        store
            .write_db_config("http://influx:8086", "tok", "lab", "sensors")
            .unwrap();
        store.write_device_name("attic").unwrap();
        store
    }

    #[test]
    fn averages_exactly_the_configured_number_of_cycles() {
        let readings = [20.0, 21.0, 19.0, 20.0, 22.0, 20.0, 21.0, 19.0, 20.0, 20.0];
        let mut pipeline = pipeline(ScriptedProbe::new(&readings), FakeConnector::default(), 10);

        let average = pipeline.measure();

        assert!((average - 20.2).abs() < 1e-9, "{average}");
        assert_eq!(pipeline.clock.now(), Duration::from_secs(10));
    }

    #[test]
    fn disconnected_reading_restarts_the_batch() {
        let readings = [10.0, 10.0, SensorReading::DISCONNECTED_C, 20.0, 22.0, 21.0];
        let mut pipeline = pipeline(ScriptedProbe::new(&readings), FakeConnector::default(), 3);

        let average = pipeline.measure();

        assert!((average - 21.0).abs() < 1e-9, "{average}");
        assert_eq!(pipeline.probe.remaining(), 0);
    }

    #[test]
    fn disconnect_on_the_last_sample_discards_the_whole_batch() {
        let readings = [10.0, 10.0, SensorReading::DISCONNECTED_C, 30.0, 31.0, 32.0];
        let mut pipeline = pipeline(ScriptedProbe::new(&readings), FakeConnector::default(), 3);

        let average = pipeline.measure();

        assert!((average - 31.0).abs() < 1e-9, "{average}");
        assert_eq!(pipeline.probe.remaining(), 0);
        assert_eq!(pipeline.clock.now(), Duration::from_secs(6));
    }

    #[test]
    fn radio_error_while_joining_is_a_wifi_error() {
        let wifi = FakeWifi::with_networks(&["home"]);
        wifi.state().join_error = Some("wifi password too long".to_string());
        let connector = FakeConnector::default();
        let mut pipeline = pipeline(ScriptedProbe::new(&[]), connector.clone(), 1);

        let verdict = pipeline.validate(&configured_store(), &mut link(wifi.clone())).unwrap();

        assert_eq!(verdict, Verdict::Fatal(ErrorKind::WifiConfig));
        assert_eq!(wifi.state().joins.len(), 1);
        assert!(connector.state().endpoints.is_empty());
    }

    #[test]
    fn missing_ssid_is_a_wifi_parameter_error() {
        let store = PersistedConfig::new(MemoryStorage::new(), "pref");
        store
            .write_db_config("http://influx:8086", "tok", "lab", "sensors")
            .unwrap();
        let wifi = FakeWifi::with_networks(&["home"]);
        let mut pipeline = pipeline(ScriptedProbe::new(&[]), FakeConnector::default(), 1);

        let verdict = pipeline.validate(&store, &mut link(wifi.clone())).unwrap();

        assert_eq!(verdict, Verdict::Fatal(ErrorKind::WifiConfig));
        assert!(wifi.state().joins.is_empty());
    }

    #[test]
    fn missing_database_field_is_checked_before_connecting() {
        let store = PersistedConfig::new(MemoryStorage::new(), "pref");
        store.write_network_config("home", "secret").unwrap();
        store.write_db_config("http://influx:8086", "", "lab", "sensors").unwrap();
        let wifi = FakeWifi::with_networks(&["home"]);
        let mut pipeline = pipeline(ScriptedProbe::new(&[]), FakeConnector::default(), 1);

        let verdict = pipeline.validate(&store, &mut link(wifi.clone())).unwrap();

        assert_eq!(verdict, Verdict::Fatal(ErrorKind::DbConfig));
        assert!(wifi.state().joins.is_empty());
    }

    #[test]
    fn unreachable_network_is_a_wifi_error() {
        let wifi = FakeWifi::with_networks(&["office"]);
        let mut pipeline = pipeline(ScriptedProbe::new(&[]), FakeConnector::default(), 1);

        let verdict = pipeline.validate(&configured_store(), &mut link(wifi)).unwrap();

        assert_eq!(verdict, Verdict::Fatal(ErrorKind::WifiConfig));
    }

    #[test]
    fn rejected_parameters_are_fatal_but_other_validation_failures_are_not() {
        let wifi = FakeWifi::with_networks(&["home"]);

        let connector = FakeConnector::default();
        connector.state().validation = Err(DbError::InvalidParameters("bad token".to_string()));
        let mut rejecting = pipeline(ScriptedProbe::new(&[]), connector, 1);
        let verdict = rejecting
            .validate(&configured_store(), &mut link(wifi.clone()))
            .unwrap();
        assert_eq!(verdict, Verdict::Fatal(ErrorKind::DbConfig));

        let connector = FakeConnector::default();
        connector.state().validation = Err(DbError::Transport("timed out".to_string()));
        let mut flaky = pipeline(ScriptedProbe::new(&[]), connector, 1);
        let verdict = flaky.validate(&configured_store(), &mut link(wifi)).unwrap();
        assert_eq!(verdict, Verdict::Ready);
    }

    #[test]
    fn sends_a_tagged_point_after_validation() {
        let wifi = FakeWifi::with_networks(&["home"]);
        let connector = FakeConnector::default();
        let mut pipeline = pipeline(ScriptedProbe::new(&[19.0, 21.0]), connector.clone(), 2);
        let mut link = link(wifi);

        assert_eq!(pipeline.validate(&configured_store(), &mut link).unwrap(), Verdict::Ready);
        pipeline.sample_and_send(&mut link).unwrap();

        let state = connector.state();
        assert_eq!(state.endpoints[0].bucket, "sensors");
        let point = &state.written[0];
        assert_eq!(point.measurement(), "attic");
        assert_eq!(point.tag(TAG_DEVICE), Some("ESP32"));
        assert_eq!(point.tag(TAG_NETWORK), Some("home"));
        assert_eq!(point.field(FIELD_RSSI), Some(&FieldValue::Integer(-55)));
        assert_eq!(point.field(FIELD_TEMPERATURE), Some(&FieldValue::Float(20.0)));
    }

    #[test]
    fn reconnects_once_and_tolerates_write_failures() {
        let wifi = FakeWifi::with_networks(&["home"]);
        let connector = FakeConnector::default();
        let mut pipeline = pipeline(ScriptedProbe::new(&[20.0, 20.0]), connector.clone(), 1);
        let mut link = link(wifi.clone());
        assert_eq!(pipeline.validate(&configured_store(), &mut link).unwrap(), Verdict::Ready);

        wifi.state().connected = false;
        connector.state().write = Err(DbError::Transport("connection refused".to_string()));
        pipeline.sample_and_send(&mut link).unwrap();
        assert_eq!(wifi.state().joins.len(), 2);

        wifi.state().available.clear();
        wifi.state().connected = false;
        pipeline.sample_and_send(&mut link).unwrap();
        assert_eq!(wifi.state().joins.len(), 3);
        assert_eq!(connector.state().attempts, 2);
    }

    #[test]
    fn refuses_to_send_before_validation() {
        let mut pipeline = pipeline(ScriptedProbe::new(&[20.0]), FakeConnector::default(), 1);
        let mut link = link(FakeWifi::default());

        assert!(matches!(pipeline.sample_and_send(&mut link), Err(Error::NotValidated)));
    }
}

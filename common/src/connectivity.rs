use std::time::Duration;

use log::{info, warn};

use crate::{error::Error, platform::Clock};

/// Wireless association primitives of the radio.
pub trait WifiLink {
    fn disconnect(&mut self) -> Result<(), Error>;

    /// Blocking scan; returns network names strongest first.
    fn scan(&mut self) -> Result<Vec<String>, Error>;

    /// Starts associating with `ssid`. Returns without waiting for the link.
    fn begin(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Received signal strength of the current association, in dBm.
    fn rssi(&self) -> Option<i32>;

    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> Result<(), Error>;
}

pub struct ConnectivityManager<W, C> {
    link: W,
    clock: C,
    ssid: String,
    password: String,
    networks: Vec<String>,
    poll_interval: Duration,
    max_polls: Option<u32>,
}

impl<W: WifiLink, C: Clock> ConnectivityManager<W, C> {
    pub fn new(link: W, clock: C, poll_interval: Duration, max_polls: Option<u32>) -> Self {
        Self {
            link,
            clock,
            ssid: String::new(),
            password: String::new(),
            networks: Vec::new(),
            poll_interval,
            max_polls,
        }
    }

    pub fn set_credentials(&mut self, ssid: &str, password: &str) {
        self.ssid = ssid.to_string();
        self.password = password.to_string();
    }

    pub fn networks(&self) -> &[String] {
        &self.networks
    }

    /// Drops any association and rescans. An empty result is not an error.
    pub fn discover_networks(&mut self) -> Result<Vec<String>, Error> {
        if let Err(err) = self.link.disconnect() {
            warn!("[wifi] disconnect before scan failed: {err}");
        }

        info!("[wifi] scanning for networks");
        self.networks = self.link.scan()?;

        if self.networks.is_empty() {
            warn!("[wifi] no networks found");
        } else {
            info!("[wifi] found {} network(s)", self.networks.len());
            for (index, ssid) in self.networks.iter().enumerate() {
                info!("[wifi] {index}) {ssid}");
            }
        }

        Ok(self.networks.clone())
    }

    /// Associates with the stored credentials and blocks until the link is up.
    ///
    /// Waits indefinitely unless the manager was built with a poll limit.
    pub fn connect(&mut self) -> Result<bool, Error> {
        if self.ssid.is_empty() {
            warn!("[wifi] no ssid configured; not connecting");
            return Ok(false);
        }

        let password = (!self.password.is_empty()).then_some(self.password.as_str());
        self.link.begin(&self.ssid, password)?;
        info!("[wifi] connecting to `{}`", self.ssid);

        let mut polls = 0_u32;
        while !self.link.is_connected() {
            if self.max_polls.is_some_and(|max| polls >= max) {
                warn!(
                    "[wifi] `{}` still down after {polls} checks; giving up",
                    self.ssid
                );
                return Ok(false);
            }
            self.clock.sleep(self.poll_interval);
            polls = polls.saturating_add(1);
        }

        info!("[wifi] connected to `{}`", self.ssid);
        Ok(true)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn rssi(&self) -> Option<i32> {
        self.link.rssi()
    }

    pub fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), Error> {
        let password = (!password.is_empty()).then_some(password);
        self.link.start_access_point(ssid, password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWifi, ManualClock};

    fn manager(wifi: FakeWifi, max_polls: Option<u32>) -> ConnectivityManager<FakeWifi, ManualClock> {
        ConnectivityManager::new(wifi, ManualClock::default(), Duration::from_millis(500), max_polls)
    }

    #[test]
    fn empty_ssid_fails_without_touching_the_radio() {
        let wifi = FakeWifi::default();
        let mut link = manager(wifi.clone(), Some(3));

        assert!(!link.connect().unwrap());
        assert!(wifi.state().joins.is_empty());
    }

    #[test]
    fn open_network_joins_without_password() {
        let wifi = FakeWifi::with_networks(&["cafe"]);
        let mut link = manager(wifi.clone(), Some(3));
        link.set_credentials("cafe", "");

        assert!(link.connect().unwrap());
        assert_eq!(wifi.state().joins, vec![("cafe".to_string(), None)]);
    }

    #[test]
    fn polls_until_link_comes_up() {
        let wifi = FakeWifi::with_networks(&["home"]);
        wifi.state().up_after_polls = 4;
        let clock = ManualClock::default();
        let mut link =
            ConnectivityManager::new(wifi.clone(), clock.clone(), Duration::from_millis(500), None);
        link.set_credentials("home", "secret");

        assert!(link.connect().unwrap());
        assert_eq!(clock.now(), Duration::from_millis(2_000));
        assert_eq!(
            wifi.state().joins,
            vec![("home".to_string(), Some("secret".to_string()))]
        );
    }

    #[test]
    fn bounded_wait_gives_up() {
        let wifi = FakeWifi::with_networks(&["home"]);
        let mut link = manager(wifi, Some(3));
        link.set_credentials("elsewhere", "secret");

        assert!(!link.connect().unwrap());
    }

    #[test]
    fn discovery_disconnects_and_caches() {
        let wifi = FakeWifi::with_networks(&["home", "office"]);
        wifi.state().connected = true;
        let mut link = manager(wifi.clone(), Some(1));

        let networks = link.discover_networks().unwrap();

        assert_eq!(networks, vec!["home".to_string(), "office".to_string()]);
        assert_eq!(link.networks(), networks.as_slice());
        assert!(!wifi.state().connected);
    }

    #[test]
    fn discovery_with_nothing_in_range_is_not_fatal() {
        let mut link = manager(FakeWifi::default(), Some(1));
        assert!(link.discover_networks().unwrap().is_empty());
    }
}

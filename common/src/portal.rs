use std::{
    fmt::Write as _,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use log::{info, warn};

use crate::{
    error::{Error, StoreError},
    platform::Clock,
    store::{KeyValueStorage, PersistedConfig},
    types::{ErrorKind, FormScope},
};

pub const FORM_PATH: &str = "/";
pub const SUBMIT_PATH: &str = "/input";

/// Paths phones and laptops probe after joining a network; answering them
/// with the form pops the captive-portal sheet.
pub const CAPTIVE_PROBE_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

const FORM_STYLE: &str = "body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}\
.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}\
label{display:block;margin:.5rem 0 .2rem}\
input[type=text],input[type=password],input[type=number]{width:100%;padding:.5rem;box-sizing:border-box}\
.muted{color:#555}button{padding:.55rem .9rem;margin-top:.8rem}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalRequest<'a> {
    Form,
    /// Raw query string of a submission, without the leading `?`.
    Submit(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl PortalResponse {
    fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body,
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }
}

/// Request dispatch target registered with the HTTP server.
pub trait PortalRoutes: Send + Sync {
    fn handle(&self, request: PortalRequest<'_>) -> PortalResponse;
}

/// The embedded web server collaborator.
pub trait PortalServer {
    /// Registers the form, submission and captive-probe endpoints and starts
    /// accepting requests.
    fn serve(&mut self, routes: Arc<dyn PortalRoutes>) -> Result<(), Error>;

    /// Services pending requests for servers driven from the control loop.
    fn service(&mut self) {}
}

/// Renders the provisioning page for the given field groups.
pub fn render_form(scope: FormScope, networks: &[String]) -> String {
    let mut html = String::with_capacity(2048);
    html.push_str("<!doctype html><html lang=\"en\"><head><meta charset=\"utf-8\">");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">");
    html.push_str("<title>Temperature Sensor</title><style>");
    html.push_str(FORM_STYLE);
    html.push_str("</style></head><body><h1>Temperature Sensor Setup</h1>");
    let _ = write!(html, "<form action=\"{SUBMIT_PATH}\" method=\"get\">");

    if scope.includes_device_name() {
        html.push_str("<div class=\"card\"><h2>Device</h2>");
        html.push_str("<label>Device name</label><input type=\"text\" name=\"name\">");
        html.push_str("</div>");
    }

    if scope.includes_network() {
        html.push_str("<div class=\"card\"><h2>Network</h2>");
        if networks.is_empty() {
            html.push_str("<p class=\"muted\">No networks found. Restart the device to scan again.</p>");
        } else {
            for (index, ssid) in networks.iter().enumerate() {
                let _ = write!(html, "<p>{index}) {}</p>", escape_html(ssid));
            }
            let _ = write!(
                html,
                "<label>Network number</label><input type=\"number\" name=\"ssid\" min=\"0\" max=\"{}\">",
                networks.len() - 1
            );
        }
        html.push_str("<label>Password (leave blank to keep current)</label>");
        html.push_str("<input type=\"password\" name=\"passwd\">");
        html.push_str("</div>");
    }

    if scope.includes_database() {
        html.push_str("<div class=\"card\"><h2>InfluxDB</h2>");
        for (label, name) in [
            ("URL", "influxUrl"),
            ("Token", "influxToken"),
            ("Organisation", "influxOrganisation"),
            ("Bucket", "influxBucket"),
        ] {
            let _ = write!(
                html,
                "<label>InfluxDB {label}</label><input type=\"text\" name=\"{name}\">"
            );
        }
        html.push_str("</div>");
    }

    html.push_str("<button type=\"submit\">Save Configuration</button></form></body></html>");
    html
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Longest WPA2 passphrase the radio accepts.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Operator-submitted form fields. Absent fields are empty and leave the
/// stored value untouched. Only the network index is trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    pub ssid_index: String,
    pub password: String,
    pub db_url: String,
    pub db_token: String,
    pub db_organization: String,
    pub db_bucket: String,
}

impl Submission {
    pub fn from_query(query: &str) -> Self {
        let mut submission = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match &*key {
                "name" => &mut submission.name,
                "ssid" => {
                    submission.ssid_index = value.trim().to_string();
                    continue;
                }
                "passwd" => &mut submission.password,
                "influxUrl" => &mut submission.db_url,
                "influxToken" => &mut submission.db_token,
                "influxOrganisation" => &mut submission.db_organization,
                "influxBucket" => &mut submission.db_bucket,
                _ => continue,
            };
            *slot = value.into_owned();
        }
        submission
    }

    /// Resolves the network index against the list shown to the operator.
    /// `Ok(None)` means no network was picked.
    pub fn resolve_ssid<'a>(&self, networks: &'a [String]) -> Result<Option<&'a str>, SubmitError> {
        if self.ssid_index.is_empty() {
            return Ok(None);
        }

        let index = self
            .ssid_index
            .parse::<usize>()
            .map_err(|_| SubmitError::UnknownNetwork(self.ssid_index.clone()))?;

        networks
            .get(index)
            .map(|ssid| Some(ssid.as_str()))
            .ok_or_else(|| SubmitError::UnknownNetwork(self.ssid_index.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("network selection `{0}` is not in the scanned list")]
    UnknownNetwork(String),
    #[error("wifi password is longer than 64 bytes")]
    PasswordTooLong,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration store is unavailable")]
    Poisoned,
}

/// Serves the form and applies submissions to the persisted configuration.
pub struct PortalHandler<S> {
    form_html: String,
    networks: Vec<String>,
    store: Mutex<PersistedConfig<S>>,
    submitted: Arc<AtomicBool>,
}

impl<S: KeyValueStorage> PortalHandler<S> {
    pub fn new(
        form_html: String,
        networks: Vec<String>,
        store: PersistedConfig<S>,
        submitted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            form_html,
            networks,
            store: Mutex::new(store),
            submitted,
        }
    }

    pub fn apply(&self, submission: &Submission) -> Result<(), SubmitError> {
        let mut store = self.store.lock().map_err(|_| SubmitError::Poisoned)?;

        let resolved = submission.resolve_ssid(&self.networks).and_then(|ssid| {
            if submission.password.len() > MAX_PASSWORD_LEN {
                return Err(SubmitError::PasswordTooLong);
            }
            Ok(ssid.unwrap_or_default())
        });
        let ssid = match resolved {
            Ok(ssid) => ssid,
            Err(err) => {
                store.set_error_code(Some(ErrorKind::WifiConfig))?;
                return Err(err);
            }
        };

        if !ssid.is_empty() {
            info!("[portal] ssid: {ssid}");
        }
        if !submission.password.is_empty() {
            info!("[portal] password: <{} chars>", submission.password.len());
        }
        if !submission.db_url.is_empty() {
            info!("[portal] influx url: {}", submission.db_url);
        }
        if !submission.db_organization.is_empty() {
            info!("[portal] influx organisation: {}", submission.db_organization);
        }
        if !submission.db_bucket.is_empty() {
            info!("[portal] influx bucket: {}", submission.db_bucket);
        }

        store.write_device_name(&submission.name)?;
        store.write_network_config(ssid, &submission.password)?;
        store.write_db_config(
            &submission.db_url,
            &submission.db_token,
            &submission.db_organization,
            &submission.db_bucket,
        )?;
        store.set_configured(true)?;
        Ok(())
    }
}

impl<S: KeyValueStorage> PortalRoutes for PortalHandler<S> {
    fn handle(&self, request: PortalRequest<'_>) -> PortalResponse {
        match request {
            PortalRequest::Form => PortalResponse::html(self.form_html.clone()),
            PortalRequest::Submit(query) => {
                let submission = Submission::from_query(query);
                match self.apply(&submission) {
                    Ok(()) => {
                        info!("[portal] setup done; restarting shortly");
                        self.submitted.store(true, Ordering::SeqCst);
                        PortalResponse::text(200, "Configuration done")
                    }
                    Err(err @ (SubmitError::UnknownNetwork(_) | SubmitError::PasswordTooLong)) => {
                        warn!("[portal] rejected submission: {err}");
                        self.submitted.store(true, Ordering::SeqCst);
                        PortalResponse::text(
                            400,
                            format!("{err}; the device restarts to scan again"),
                        )
                    }
                    Err(err) => {
                        warn!("[portal] failed to store submission: {err}");
                        PortalResponse::text(500, "Failed to store configuration")
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalStatus {
    Idle,
    Serving,
    RestartDue,
}

/// Owns the access-point lifetime of the provisioning exchange.
pub struct ProvisioningPortal<V, C> {
    server: V,
    clock: C,
    restart_delay: Duration,
    submitted: Arc<AtomicBool>,
    restart_at: Option<Duration>,
    serving: bool,
}

impl<V: PortalServer, C: Clock> ProvisioningPortal<V, C> {
    pub fn new(server: V, clock: C, restart_delay: Duration) -> Self {
        Self {
            server,
            clock,
            restart_delay,
            submitted: Arc::new(AtomicBool::new(false)),
            restart_at: None,
            serving: false,
        }
    }

    /// Registers the endpoints and begins accepting requests. The scan list
    /// is captured here and never rebuilt while the portal lives.
    pub fn start<S: KeyValueStorage>(
        &mut self,
        form_html: String,
        networks: Vec<String>,
        store: PersistedConfig<S>,
    ) -> Result<(), Error> {
        self.submitted.store(false, Ordering::SeqCst);
        self.restart_at = None;

        let handler = PortalHandler::new(form_html, networks, store, self.submitted.clone());
        self.server.serve(Arc::new(handler))?;
        self.serving = true;
        info!("[portal] accepting configuration requests");
        Ok(())
    }

    /// Non-blocking; call every control-loop tick while provisioning.
    pub fn poll(&mut self) -> PortalStatus {
        if !self.serving {
            return PortalStatus::Idle;
        }

        self.server.service();

        let now = self.clock.uptime();
        match self.restart_at {
            Some(deadline) if now >= deadline => PortalStatus::RestartDue,
            Some(_) => PortalStatus::Serving,
            None if self.submitted.load(Ordering::SeqCst) => {
                self.restart_at = Some(now + self.restart_delay);
                PortalStatus::Serving
            }
            None => PortalStatus::Serving,
        }
    }
}

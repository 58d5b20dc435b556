use log::{info, warn};

use crate::{
    config::NodeConfig,
    connectivity::ConnectivityManager,
    error::Error,
    platform::{Board, Platform},
    portal::{render_form, PortalStatus, ProvisioningPortal},
    store::PersistedConfig,
    telemetry::{TelemetryPipeline, Verdict},
    types::{ErrorKind, FormScope},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Boot,
    Provisioning,
    Validating,
    Running,
    Fatal(ErrorKind),
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Provisioning => "PROVISIONING",
            Self::Validating => "VALIDATING",
            Self::Running => "RUNNING",
            Self::Fatal(_) => "FATAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    FactoryReset,
    Provisioned,
    Fatal(ErrorKind),
}

/// What the platform loop must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Hard-reset the device; every in-memory component is discarded.
    Restart(RestartReason),
}

/// Boot decision and main-loop dispatch for one power cycle.
pub struct Supervisor<P: Platform> {
    settings: NodeConfig,
    state: SupervisorState,
    store: PersistedConfig<P::Storage>,
    connectivity: ConnectivityManager<P::Wifi, P::Clock>,
    portal: ProvisioningPortal<P::Server, P::Clock>,
    pipeline: TelemetryPipeline<P::Probe, P::Connector, P::Clock>,
    factory_reset_requested: bool,
}

impl<P: Platform> Supervisor<P> {
    pub fn new(mut settings: NodeConfig, board: Board<P>) -> Self {
        settings.sanitize();

        let Board {
            storage,
            wifi,
            server,
            probe,
            connector,
            clock,
            factory_reset_requested,
        } = board;

        let store = PersistedConfig::new(storage, settings.storage_namespace.clone());
        let connectivity = ConnectivityManager::new(
            wifi,
            clock.clone(),
            settings.wifi_poll_interval(),
            settings.wifi_connect_max_polls,
        );
        let portal = ProvisioningPortal::new(server, clock.clone(), settings.restart_delay());
        let pipeline = TelemetryPipeline::new(
            probe,
            connector,
            clock,
            settings.sample_cycles,
            settings.sample_interval(),
            settings.device_model.clone(),
            settings.default_device_name.clone(),
        );

        Self {
            settings,
            state: SupervisorState::Boot,
            store,
            connectivity,
            portal,
            pipeline,
            factory_reset_requested,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Runs one scheduler tick. A failure while validating is routed through
    /// FATAL. Other errors come from the storage or radio layers and are
    /// unrecoverable in-process; the caller should reset the device.
    pub fn tick(&mut self) -> Result<Step, Error> {
        match self.state {
            SupervisorState::Boot => self.boot(),
            SupervisorState::Provisioning => Ok(match self.portal.poll() {
                PortalStatus::RestartDue => Step::Restart(RestartReason::Provisioned),
                PortalStatus::Idle | PortalStatus::Serving => Step::Continue,
            }),
            SupervisorState::Validating => {
                self.state = match self.pipeline.validate(&self.store, &mut self.connectivity) {
                    Ok(Verdict::Ready) => {
                        info!("[supervisor] validation passed; sampling");
                        SupervisorState::Running
                    }
                    Ok(Verdict::Fatal(kind)) => SupervisorState::Fatal(kind),
                    Err(err) => {
                        warn!("[supervisor] validation aborted: {err}");
                        SupervisorState::Fatal(ErrorKind::WifiConfig)
                    }
                };
                Ok(Step::Continue)
            }
            SupervisorState::Running => {
                self.pipeline.sample_and_send(&mut self.connectivity)?;
                Ok(Step::Continue)
            }
            SupervisorState::Fatal(kind) => {
                warn!("[supervisor] fatal {}; back to provisioning", kind.as_str());
                self.store.set_error_code(Some(kind))?;
                self.store.set_configured(false)?;
                Ok(Step::Restart(RestartReason::Fatal(kind)))
            }
        }
    }

    fn boot(&mut self) -> Result<Step, Error> {
        if self.factory_reset_requested {
            warn!("[supervisor] factory reset requested");
            self.store.clear()?;
            return Ok(Step::Restart(RestartReason::FactoryReset));
        }

        let last_error = self.store.last_error_code()?;
        self.store.set_error_code(None)?;
        self.store.reload()?;

        if self.store.is_configured() {
            info!("[supervisor] configuration found");
            self.state = SupervisorState::Validating;
            return Ok(Step::Continue);
        }

        match last_error {
            Some(kind) => info!("[supervisor] no configuration; failed last time: {}", kind.as_str()),
            None => info!("[supervisor] no configuration; no error recorded"),
        }

        let scope = FormScope::for_last_error(last_error);
        let networks = if scope.includes_network() {
            self.connectivity.discover_networks()?
        } else {
            Vec::new()
        };

        self.connectivity
            .start_access_point(&self.settings.ap_ssid, &self.settings.ap_password)?;
        self.portal.start(
            render_form(scope, &networks),
            networks,
            self.store.clone(),
        )?;
        info!(
            "[supervisor] join `{}` and open the setup page to configure the device",
            self.settings.ap_ssid
        );

        self.state = SupervisorState::Provisioning;
        Ok(Step::Continue)
    }
}

//! Instrument box runtime: wires the components together, runs one task per
//! component and tears them down on shutdown.

use heapless::HistoryBuffer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calibration::{Calibrator, RodGauge};
use crate::config::InstrumentConfig;
use crate::control::{install_limit_switch_handlers, AllowAll, Authorizer, ControlChannel, ControlTargets, NOTICE_QUEUE_LEN};
use crate::devices::{Devices, MotorDriver, Setpoints, SimulatedRig};
use crate::display::{DisplayDriver, DisplaySurface};
use crate::events::Events;
use crate::kinetics::engine::{HistorySample, HISTORY_LEN};
use crate::kinetics::{ReactorState, SimulationEngine};
use crate::link::{Backoff, Connector, LinkStatus};
use crate::telemetry::{TelemetryChannel, TelemetryCounters};
use crate::watchdog::RodProtection;

pub struct InstrumentBox {
    config: InstrumentConfig,
    devices: Devices,
    rig: Option<Arc<SimulatedRig>>,
    authorizer: Arc<dyn Authorizer>,
    events: Events,
}

impl InstrumentBox {
    pub fn new(config: InstrumentConfig, devices: Devices) -> Self {
        Self {
            config,
            devices,
            rig: None,
            authorizer: Arc::new(AllowAll),
            events: Events::new(),
        }
    }

    /// Run the rig's physics as one more task.
    pub fn with_rig(mut self, rig: Arc<SimulatedRig>) -> Self {
        self.rig = Some(rig);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Put the hardware in its safe state and spawn every task.
    pub fn start<Cc, Tc, S>(self, control: Cc, telemetry: Tc, surface: S) -> RunningBox
    where
        Cc: Connector,
        Tc: Connector,
        S: DisplaySurface + 'static,
    {
        let Self {
            config,
            devices,
            rig,
            authorizer,
            events,
        } = self;
        let timing = &config.timing;

        devices.servo.scram();
        devices.motor.stop();
        let setpoints = Arc::new(Setpoints::new());
        let links = Arc::new(LinkStatus::new());
        let gauge = Arc::new(RodGauge::new(devices.sonar.clone()));

        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_LEN);
        install_limit_switch_handlers(devices.limit_switch.as_ref(), devices.motor.clone(), notice_tx);

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if let Some(rig) = rig {
            tasks.push((
                "rig",
                tokio::spawn(rig.run(timing.rig_tick(), events.shutdown.clone())),
            ));
        }

        let calibrator = Calibrator::new(
            devices.environment.clone(),
            gauge.clone(),
            timing.calibration_interval(),
            timing.calibration_retry(),
        );
        tasks.push(("calibrator", tokio::spawn(calibrator.run(events.shutdown.clone()))));

        let engine = SimulationEngine::new(&config, gauge.clone(), setpoints.clone(), events.clone());
        let snapshots = engine.subscribe();
        let history = engine.history();
        tasks.push(("simulation", tokio::spawn(engine.run())));

        let protection = Arc::new(RodProtection::new(
            devices.motor.clone(),
            gauge.clone(),
            config.limits.max_rod_distance_cm,
            timing.watchdog_poll(),
        ));
        tasks.push((
            "rod protection",
            tokio::spawn(protection.clone().run(events.shutdown.clone())),
        ));

        let targets = ControlTargets {
            motor: devices.motor.clone(),
            servo: devices.servo.clone(),
            setpoints: setpoints.clone(),
            gauge: gauge.clone(),
            limit_switch: devices.limit_switch.clone(),
            links: links.clone(),
            max_distance_cm: config.limits.max_rod_distance_cm,
        };
        let control_channel = ControlChannel::new(
            control,
            targets,
            authorizer,
            notice_rx,
            Backoff::from_timing(timing),
            timing.network_wait(),
            events.shutdown.clone(),
        );
        tasks.push(("control", tokio::spawn(control_channel.run())));

        let telemetry_channel = TelemetryChannel::new(
            telemetry,
            snapshots.clone(),
            gauge.clone(),
            devices.motor.clone(),
            links.clone(),
            events.clone(),
            Backoff::from_timing(timing),
            timing.telemetry_liveness(),
            timing.network_wait(),
        );
        let telemetry_counters = telemetry_channel.counters();
        tasks.push(("telemetry", tokio::spawn(telemetry_channel.run())));

        let display = DisplayDriver::new(surface, devices.motor.clone(), gauge.clone(), events.clone(), &config);
        tasks.push((
            "display",
            tokio::spawn(async move {
                display.run().await;
            }),
        ));

        info!("Instrument box started with {} tasks", tasks.len());

        RunningBox {
            tasks,
            events,
            motor: devices.motor,
            setpoints,
            gauge,
            links,
            snapshots,
            history,
            protection,
            telemetry: telemetry_counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    /// Tasks that missed the grace period and were aborted.
    pub aborted: Vec<&'static str>,
}

pub struct RunningBox {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    events: Events,
    motor: Arc<MotorDriver>,
    setpoints: Arc<Setpoints>,
    gauge: Arc<RodGauge>,
    links: Arc<LinkStatus>,
    snapshots: watch::Receiver<ReactorState>,
    history: Arc<Mutex<HistoryBuffer<HistorySample, HISTORY_LEN>>>,
    protection: Arc<RodProtection>,
    telemetry: Arc<TelemetryCounters>,
}

impl RunningBox {
    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn motor(&self) -> &Arc<MotorDriver> {
        &self.motor
    }

    pub fn setpoints(&self) -> &Arc<Setpoints> {
        &self.setpoints
    }

    pub fn gauge(&self) -> &Arc<RodGauge> {
        &self.gauge
    }

    pub fn links(&self) -> &Arc<LinkStatus> {
        &self.links
    }

    pub fn snapshots(&self) -> watch::Receiver<ReactorState> {
        self.snapshots.clone()
    }

    /// Recent (t, rho, n) samples, oldest first.
    pub fn history(&self) -> Vec<HistorySample> {
        self.history.lock().oldest_ordered().copied().collect()
    }

    pub fn protection(&self) -> &Arc<RodProtection> {
        &self.protection
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCounters> {
        &self.telemetry
    }

    /// Wait for an external shutdown request, then stop.
    pub async fn wait(self, grace: Duration) -> ShutdownReport {
        self.events.shutdown.wait().await;
        self.shutdown(grace).await
    }

    /// Raise shutdown, join every task within `grace`, abort stragglers and
    /// leave the motor stopped.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        info!("Shutting down instrument box");
        self.events.shutdown.trigger();

        let deadline = tokio::time::Instant::now() + grace;
        let mut joined = 0;
        let mut aborted = Vec::new();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => joined += 1,
                Ok(Err(e)) => warn!("Task {} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Task {} missed the shutdown deadline, aborting", name);
                    handle.abort();
                    aborted.push(name);
                }
            }
        }

        self.motor.stop();
        info!(
            "Instrument box stopped: {} joined, {} aborted, motor {:?}",
            joined,
            aborted.len(),
            self.motor.current_status()
        );
        ShutdownReport { joined, aborted }
    }
}

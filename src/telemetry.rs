//! Telemetry channel: one 20-byte frame per published simulation step, plus a
//! liveness frame whenever the simulation goes quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::calibration::RodGauge;
use crate::devices::MotorDriver;
use crate::events::Events;
use crate::kinetics::ReactorState;
use crate::link::{connect_with_backoff, write_with_timeout, Backoff, Connector, LinkError, LinkStatus};
use crate::protocol::{epoch_millis, TelemetryFrame};

const STATUS_LOG_EVERY: u64 = 10;

#[derive(Debug, Default)]
pub struct TelemetryCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    connections: AtomicU64,
}

impl TelemetryCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

pub struct TelemetryChannel<C: Connector> {
    connector: C,
    snapshots: watch::Receiver<ReactorState>,
    gauge: Arc<RodGauge>,
    motor: Arc<MotorDriver>,
    links: Arc<LinkStatus>,
    events: Events,
    backoff: Backoff,
    liveness: Duration,
    network_wait: Duration,
    counters: Arc<TelemetryCounters>,
}

impl<C: Connector> TelemetryChannel<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: C,
        snapshots: watch::Receiver<ReactorState>,
        gauge: Arc<RodGauge>,
        motor: Arc<MotorDriver>,
        links: Arc<LinkStatus>,
        events: Events,
        backoff: Backoff,
        liveness: Duration,
        network_wait: Duration,
    ) -> Self {
        Self {
            connector,
            snapshots,
            gauge,
            motor,
            links,
            events,
            backoff,
            liveness,
            network_wait,
            counters: Arc::new(TelemetryCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }

    /// Frame for the latest published state and measured position.
    pub fn current_frame(&self) -> TelemetryFrame {
        let state = *self.snapshots.borrow();
        let position = self.gauge.latest();
        TelemetryFrame::new(state.n, state.rho, position.distance_cm, epoch_millis())
    }

    pub async fn run(mut self) {
        info!("Telemetry channel started, hub {}", self.connector.describe());
        let shutdown = self.events.shutdown.clone();

        loop {
            self.links.set_telemetry(false);
            if self.motor.stop() {
                warn!("Telemetry link down, motor held stopped");
            }
            let Some(stream) =
                connect_with_backoff(&self.connector, &mut self.backoff, &shutdown, "telemetry").await
            else {
                break;
            };
            self.counters.connections.fetch_add(1, Ordering::Relaxed);
            self.links.set_telemetry(true);

            match self.stream_frames(stream).await {
                Ok(()) => break,
                Err(e) => warn!("Telemetry link lost: {}", e),
            }
        }

        self.links.set_telemetry(false);
        info!(
            "Telemetry channel stopped ({} sent, {} dropped)",
            self.counters.sent(),
            self.counters.dropped()
        );
    }

    async fn stream_frames<W: AsyncWrite + Unpin>(&mut self, mut stream: W) -> Result<(), LinkError> {
        let shutdown = self.events.shutdown.clone();
        let updated = self.events.state_updated.clone();

        loop {
            let fresh = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                raised = updated.wait_timeout(self.liveness) => raised,
            };
            updated.take();
            if !fresh {
                debug!("No new state within {:?}, sending liveness frame", self.liveness);
            }

            let frame = self.current_frame();
            if let Err(e) = write_with_timeout(&mut stream, &frame.encode(), self.network_wait).await {
                // The sample is not retried; the next one supersedes it.
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }

            let sent = self.counters.sent.fetch_add(1, Ordering::Relaxed) + 1;
            if sent % STATUS_LOG_EVERY == 0 {
                info!(
                    "Telemetry #{}: N {:.3e}, rho {:.0} pcm, distance {:.1} cm",
                    sent,
                    frame.neutron_density,
                    frame.reactivity * 1e5,
                    frame.distance
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{RigParams, SimulatedRig};
    use crate::link::TcpConnector;
    use crate::protocol::FRAME_SIZE;

    fn channel(events: Events) -> (TelemetryChannel<TcpConnector>, watch::Sender<ReactorState>) {
        let rig = Arc::new(SimulatedRig::new(RigParams::default()));
        let (tx, rx) = watch::channel(ReactorState::initial(1.0));
        let channel = TelemetryChannel::new(
            TcpConnector::new("127.0.0.1:9"),
            rx,
            Arc::new(RodGauge::new(rig.clone())),
            Arc::new(MotorDriver::new(rig)),
            Arc::new(LinkStatus::new()),
            events,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(10)),
            Duration::from_millis(50),
            Duration::from_millis(100),
        );
        (channel, tx)
    }

    #[test]
    fn test_frame_uses_latest_snapshot() {
        let (channel, tx) = channel(Events::new());
        let mut state = ReactorState::initial(1.0);
        state.n = 42.0;
        state.rho = -0.002;
        tx.send_replace(state);

        let frame = channel.current_frame();
        assert_eq!(frame.neutron_density, 42.0);
        assert!((frame.reactivity + 0.002).abs() < 1e-7);
        // No measurement yet.
        assert!((frame.distance as f64 + 999.9).abs() < 1e-3);
        assert!(frame.timestamp_ms > 1.6e12);
    }

    #[tokio::test]
    async fn test_liveness_frames_without_updates() {
        let events = Events::new();
        let (mut channel, _tx) = channel(events.clone());
        let (mut client, server) = tokio::io::duplex(1024);

        let stream = tokio::spawn(async move {
            let _ = channel.stream_frames(server).await;
            channel.counters()
        });

        let mut buf = [0u8; FRAME_SIZE * 2];
        tokio::time::timeout(
            Duration::from_millis(500),
            tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf),
        )
        .await
        .expect("no liveness frames")
        .unwrap();

        events.shutdown.trigger();
        let counters = stream.await.unwrap();
        assert!(counters.sent() >= 2);
        let first = TelemetryFrame::decode(&buf[..FRAME_SIZE]).unwrap();
        assert_eq!(first.neutron_density, 1.0);
    }

    #[tokio::test]
    async fn test_closed_peer_drops_sample() {
        let events = Events::new();
        let (mut channel, _tx) = channel(events.clone());
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        events.state_updated.raise();
        let result = channel.stream_frames(server).await;
        assert!(result.is_err());
        assert_eq!(channel.counters().dropped(), 1);
    }
}

//! 8x8 matrix display driver.
//!
//! The driver decides what to show; a [`DisplaySurface`] owns the pixels.
//! Normal frames show an arrow for the motor direction over a bar for the rod
//! height. An explosion interrupts them with a ring animation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::calibration::RodGauge;
use crate::config::InstrumentConfig;
use crate::devices::{MotorDriver, MotorStatus};
use crate::events::Events;

pub const MAX_BAR: u8 = 8;
const EXPLOSION_RINGS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrow {
    Up,
    Down,
    Still,
}

impl From<MotorStatus> for Arrow {
    fn from(status: MotorStatus) -> Self {
        match status {
            MotorStatus::MovingUp => Arrow::Up,
            MotorStatus::MovingDown => Arrow::Down,
            MotorStatus::Stopped => Arrow::Still,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawIntent {
    pub arrow: Arrow,
    /// Rod height in rows, `0..=MAX_BAR`.
    pub bar: u8,
    /// Alternates every frame while the status holds, so the arrow appears
    /// to move.
    pub jiggle: bool,
}

pub trait DisplaySurface: Send {
    fn start_up(&mut self);
    fn draw(&mut self, intent: DrawIntent);
    /// Ring `1..=4` from the centre outwards.
    fn explosion_frame(&mut self, ring: u8, filled: bool);
    fn shut_down(&mut self);
}

/// Surface for boxes without a matrix: changes go to the log.
#[derive(Debug, Default)]
pub struct LogSurface {
    last: Option<(Arrow, u8)>,
}

impl DisplaySurface for LogSurface {
    fn start_up(&mut self) {
        debug!("Display up");
    }

    fn draw(&mut self, intent: DrawIntent) {
        let shown = (intent.arrow, intent.bar);
        if self.last != Some(shown) {
            debug!("Display: {:?} arrow, bar {}/{}", intent.arrow, intent.bar, MAX_BAR);
            self.last = Some(shown);
        }
    }

    fn explosion_frame(&mut self, ring: u8, filled: bool) {
        debug!("Display: explosion ring {} ({})", ring, if filled { "filled" } else { "hollow" });
        self.last = None;
    }

    fn shut_down(&mut self) {
        debug!("Display off");
    }
}

/// Rows lit for a rod distance. Unknown or out-of-range distances clamp.
pub fn bar_height(distance_cm: f64, bar_min_cm: f64, bar_max_cm: f64) -> u8 {
    let span = bar_max_cm - bar_min_cm;
    if !distance_cm.is_finite() || span <= 0.0 {
        return 0;
    }
    let rows = (7.0 * (distance_cm - bar_min_cm) / span).trunc();
    rows.clamp(0.0, f64::from(MAX_BAR)) as u8
}

pub struct DisplayDriver<S: DisplaySurface> {
    surface: S,
    motor: Arc<MotorDriver>,
    gauge: Arc<RodGauge>,
    events: Events,
    bar_min_cm: f64,
    bar_max_cm: f64,
    frame: Duration,
    explosion_frame: Duration,
}

impl<S: DisplaySurface> DisplayDriver<S> {
    pub fn new(
        surface: S,
        motor: Arc<MotorDriver>,
        gauge: Arc<RodGauge>,
        events: Events,
        config: &InstrumentConfig,
    ) -> Self {
        Self {
            surface,
            motor,
            gauge,
            events,
            bar_min_cm: config.display.bar_min_cm,
            bar_max_cm: config.limits.max_rod_distance_cm,
            frame: Duration::from_millis(config.display.frame_ms),
            explosion_frame: Duration::from_millis(config.display.explosion_frame_ms),
        }
    }

    pub fn intent(&self, jiggle: bool) -> DrawIntent {
        DrawIntent {
            arrow: self.motor.current_status().into(),
            bar: bar_height(self.gauge.latest().distance_cm, self.bar_min_cm, self.bar_max_cm),
            jiggle,
        }
    }

    /// Returns `false` if shutdown interrupted the animation.
    async fn play_explosion(&mut self) -> bool {
        info!("Explosion, showing animation");
        let shutdown = &self.events.shutdown;
        for filled in [true, false] {
            for ring in 1..=EXPLOSION_RINGS {
                self.surface.explosion_frame(ring, filled);
                if shutdown.wait_timeout(self.explosion_frame).await {
                    return false;
                }
            }
        }
        true
    }

    pub async fn run(mut self) -> S {
        info!("Display driver started");
        let shutdown = self.events.shutdown.clone();
        let explosion = self.events.explosion.clone();
        self.surface.start_up();
        let mut jiggle = false;

        while !shutdown.is_triggered() {
            if explosion.is_raised() {
                if !self.play_explosion().await {
                    break;
                }
                explosion.clear();
                jiggle = false;
                continue;
            }

            let intent = self.intent(jiggle);
            self.surface.draw(intent);

            let changed = tokio::select! {
                (changed, _) = self.motor.wait_for_status_change(&shutdown, self.frame) => changed,
                _ = explosion.wait() => true,
            };
            jiggle = if changed { false } else { !jiggle };
        }

        self.surface.shut_down();
        info!("Display driver stopped");
        self.surface
    }
}

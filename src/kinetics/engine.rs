use heapless::HistoryBuffer;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::solver::{DormandPrince, SolverError, StepStats, Tolerances};
use super::{PointKinetics, ReactorState, STATE_LEN};
use crate::calibration::RodGauge;
use crate::config::{InstrumentConfig, ReactivityCurve, SafetyLimits};
use crate::devices::{ServoState, Setpoints, SourceState};
use crate::events::Events;

pub const HISTORY_LEN: usize = 256;
const STATUS_LOG_EVERY: u64 = 10;

/// What the outside world contributes to one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInputs {
    /// `None` when the range sensor failed this step.
    pub distance_cm: Option<f64>,
    pub servo: ServoState,
    pub source: SourceState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Advanced,
    /// Power crossed the runaway threshold; the state was reset.
    Exploded { peak: f64 },
    /// The integrator failed; the state was reset.
    Diverged(SolverError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub t: f64,
    pub rho: f64,
    pub n: f64,
}

/// The synchronous core of the simulation: one call to [`step`] advances the
/// reactor by one cadence interval.
///
/// [`step`]: ReactorSimulator::step
#[derive(Debug)]
pub struct ReactorSimulator {
    kinetics: PointKinetics,
    curve: ReactivityCurve,
    limits: SafetyLimits,
    solver: DormandPrince,
    state: ReactorState,
    explosions: u32,
    divergences: u32,
}

impl ReactorSimulator {
    pub fn new(config: &InstrumentConfig) -> Self {
        let limits = config.limits;
        Self {
            kinetics: PointKinetics::new(config.kinetics),
            curve: config.reactivity,
            limits,
            solver: DormandPrince::new(Tolerances {
                rtol: limits.rtol,
                atol: limits.atol,
                min_step: limits.min_step_s,
                max_substeps: limits.max_substeps,
            }),
            state: ReactorState::initial(config.kinetics.n0),
            explosions: 0,
            divergences: 0,
        }
    }

    pub fn state(&self) -> ReactorState {
        self.state
    }

    pub fn kinetics(&self) -> &PointKinetics {
        &self.kinetics
    }

    pub fn explosions(&self) -> u32 {
        self.explosions
    }

    pub fn divergences(&self) -> u32 {
        self.divergences
    }

    pub fn solver_stats(&self) -> StepStats {
        self.solver.stats()
    }

    /// Replace the state, e.g. to start from equilibrium.
    pub fn set_state(&mut self, state: ReactorState) {
        self.state = state;
        self.solver.reset();
    }

    pub fn reset(&mut self) {
        let rho = self.state.rho;
        self.state = ReactorState::initial(self.kinetics.params().n0);
        self.state.rho = rho;
        self.solver.reset();
    }

    /// Reactivity for the current rod and servo state. A scrammed rod counts
    /// as fully inserted; a failed distance read counts as zero reactivity.
    pub fn reactivity(&self, inputs: &StepInputs) -> f64 {
        let max = self.limits.max_rod_distance_cm;
        match (inputs.servo, inputs.distance_cm) {
            (ServoState::Scram, _) => self.curve.reactivity(0.0, max),
            (ServoState::Engaged, Some(d)) => self.curve.reactivity(d, max),
            (ServoState::Engaged, None) => 0.0,
        }
    }

    pub fn step(&mut self, inputs: &StepInputs, dt: f64) -> StepOutcome {
        let rho = self.reactivity(inputs);
        let source = match inputs.source {
            SourceState::On => self.kinetics.params().source_strength,
            SourceState::Off => 0.0,
        };
        self.step_with(rho, source, dt)
    }

    /// Advance with an explicit reactivity and source term.
    pub fn step_with(&mut self, rho: f64, source: f64, dt: f64) -> StepOutcome {
        let kinetics = self.kinetics;
        let t0 = self.state.t;
        let t1 = t0 + dt;

        let result = self
            .solver
            .integrate(
                |_, y: &[f64; STATE_LEN]| kinetics.derivative(y, rho, source),
                t0,
                self.state.to_vector(),
                t1,
            )
            .and_then(|y| check_physical(&y, t1).map(|_| y));

        match result {
            Ok(y) if y[0] > self.limits.runaway_threshold => {
                self.explosions += 1;
                self.state.rho = rho;
                self.reset();
                StepOutcome::Exploded { peak: y[0] }
            }
            Ok(y) => {
                self.state = ReactorState::from_vector(&y, rho, t1);
                StepOutcome::Advanced
            }
            Err(e) => {
                self.divergences += 1;
                self.state.rho = rho;
                self.reset();
                StepOutcome::Diverged(e)
            }
        }
    }
}

fn check_physical(y: &[f64; STATE_LEN], t: f64) -> Result<(), SolverError> {
    for (index, value) in y.iter().enumerate() {
        if !value.is_finite() {
            return Err(SolverError::NonFinite { t });
        }
        if *value < 0.0 {
            return Err(SolverError::NegativeState {
                t,
                index,
                value: *value,
            });
        }
    }
    Ok(())
}

/// Real-time driver around [`ReactorSimulator`].
///
/// Sole writer of the reactor state. Readers get copies through the watch
/// channel, so a reset is never observed half done.
pub struct SimulationEngine {
    simulator: ReactorSimulator,
    gauge: Arc<RodGauge>,
    setpoints: Arc<Setpoints>,
    snapshots: watch::Sender<ReactorState>,
    history: Arc<Mutex<HistoryBuffer<HistorySample, HISTORY_LEN>>>,
    events: Events,
    step: Duration,
}

impl SimulationEngine {
    pub fn new(
        config: &InstrumentConfig,
        gauge: Arc<RodGauge>,
        setpoints: Arc<Setpoints>,
        events: Events,
    ) -> Self {
        let simulator = ReactorSimulator::new(config);
        let (snapshots, _rx) = watch::channel(simulator.state());
        Self {
            simulator,
            gauge,
            setpoints,
            snapshots,
            history: Arc::new(Mutex::new(HistoryBuffer::new())),
            events,
            step: config.timing.simulation_step(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReactorState> {
        self.snapshots.subscribe()
    }

    /// Handle to the recent (t, rho, n) samples.
    pub fn history(&self) -> Arc<Mutex<HistoryBuffer<HistorySample, HISTORY_LEN>>> {
        self.history.clone()
    }

    fn read_inputs(&self) -> StepInputs {
        let distance_cm = match self.gauge.measure() {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("Rod position unavailable, using zero reactivity: {}", e);
                None
            }
        };
        StepInputs {
            distance_cm,
            servo: self.setpoints.servo(),
            source: self.setpoints.source(),
        }
    }

    /// One cadence tick: integrate, publish, signal.
    pub fn tick(&mut self) -> StepOutcome {
        let inputs = self.read_inputs();
        let outcome = self.simulator.step(&inputs, self.step.as_secs_f64());
        let state = self.simulator.state();

        self.snapshots.send_replace(state);
        self.history.lock().write(HistorySample {
            t: state.t,
            rho: state.rho,
            n: state.n,
        });

        match outcome {
            StepOutcome::Advanced => {}
            StepOutcome::Exploded { peak } => {
                warn!(
                    "*** Power reached {:.3e}, reactor exploded! Kinetics reset. ***",
                    peak
                );
                self.events.explosion.raise();
            }
            StepOutcome::Diverged(e) => {
                error!("Kinetics integration failed, state reset: {}", e);
            }
        }
        self.events.state_updated.raise();
        outcome
    }

    pub async fn run(mut self) {
        info!("Simulation engine started, step {:?}", self.step);
        let shutdown = self.events.shutdown.clone();
        let mut interval = tokio::time::interval(self.step);
        // Catch up after a stall so simulated time keeps pace with the wall clock.
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut steps: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait() => break,
            }
            if shutdown.is_triggered() {
                break;
            }

            self.tick();
            steps += 1;

            if steps % STATUS_LOG_EVERY == 0 {
                let state = self.simulator.state();
                let position = self.gauge.latest();
                info!(
                    "CR pos: {:4.1} cm, rho: {:.0} pcm, N: {:.2e}, t: {:.1} s",
                    position.distance_cm,
                    state.rho * 1e5,
                    state.n,
                    state.t
                );
            }
        }
        let stats = self.simulator.solver_stats();
        info!(
            "Simulation engine stopped after {} steps ({} substeps accepted, {} rejected)",
            steps, stats.accepted, stats.rejected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> ReactorSimulator {
        ReactorSimulator::new(&InstrumentConfig::default())
    }

    fn engaged_at(distance_cm: f64) -> StepInputs {
        StepInputs {
            distance_cm: Some(distance_cm),
            servo: ServoState::Engaged,
            source: SourceState::Off,
        }
    }

    #[test]
    fn test_time_advances_by_dt() {
        let mut sim = simulator();
        for _ in 0..4 {
            assert_eq!(sim.step(&engaged_at(10.0), 0.05), StepOutcome::Advanced);
        }
        assert!((sim.state().t - 0.2).abs() < 1e-12);
        assert!(sim.solver_stats().accepted >= 4);
    }

    #[test]
    fn test_scram_uses_fully_inserted_reactivity() {
        let sim = simulator();
        let mut inputs = engaged_at(15.0);
        assert!(sim.reactivity(&inputs) > 0.0);
        inputs.servo = ServoState::Scram;
        assert!(sim.reactivity(&inputs) < 0.0);
        assert_eq!(sim.reactivity(&inputs), sim.curve.reactivity(0.0, 17.0));
    }

    #[test]
    fn test_missing_distance_is_zero_reactivity() {
        let sim = simulator();
        let inputs = StepInputs {
            distance_cm: None,
            servo: ServoState::Engaged,
            source: SourceState::On,
        };
        assert_eq!(sim.reactivity(&inputs), 0.0);
    }

    #[test]
    fn test_negative_reactivity_decays_power() {
        let mut sim = simulator();
        sim.set_state(ReactorState::equilibrium(sim.kinetics().params()));
        for _ in 0..20 {
            sim.step(&engaged_at(5.0), 0.05);
        }
        assert!(sim.state().n < 1.0);
        assert!(sim.state().n > 0.0);
    }

    #[test]
    fn test_source_raises_subcritical_power() {
        let mut with_source = simulator();
        let mut without = simulator();
        let mut inputs = engaged_at(8.0);
        for _ in 0..20 {
            without.step(&inputs, 0.05);
        }
        inputs.source = SourceState::On;
        for _ in 0..20 {
            with_source.step(&inputs, 0.05);
        }
        assert!(with_source.state().n > without.state().n);
    }

    #[test]
    fn test_runaway_resets_to_initial_conditions() {
        let mut config = InstrumentConfig::default();
        config.limits.runaway_threshold = 2.0;
        let mut sim = ReactorSimulator::new(&config);

        let mut exploded = false;
        for _ in 0..200 {
            if let StepOutcome::Exploded { peak } = sim.step_with(0.01, 0.0, 0.05) {
                assert!(peak > 2.0);
                exploded = true;
                break;
            }
        }
        assert!(exploded);
        let state = sim.state();
        assert_eq!(state.n, 1.0);
        assert_eq!(state.c, [0.0; 6]);
        assert_eq!(state.t, 0.0);
        assert_eq!(sim.explosions(), 1);
    }

    #[test]
    fn test_divergence_resets_instead_of_stalling() {
        let mut config = InstrumentConfig::default();
        config.limits.max_substeps = 2;
        let mut sim = ReactorSimulator::new(&config);
        sim.step_with(0.0, 0.0, 0.05);
        // A huge interval cannot be covered in two sub-steps.
        let outcome = sim.step_with(0.0, 0.0, 1000.0);
        assert!(matches!(outcome, StepOutcome::Diverged(_)));
        assert_eq!(sim.state().t, 0.0);
        assert_eq!(sim.divergences(), 1);
    }

    #[test]
    fn test_check_physical_flags_bad_samples() {
        let mut y = [1.0; STATE_LEN];
        assert!(check_physical(&y, 0.0).is_ok());
        y[3] = -1e-3;
        assert!(matches!(
            check_physical(&y, 0.0),
            Err(SolverError::NegativeState { index: 3, .. })
        ));
        y[3] = f64::NAN;
        assert!(matches!(check_physical(&y, 0.0), Err(SolverError::NonFinite { .. })));
    }
}

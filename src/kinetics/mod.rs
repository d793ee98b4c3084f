//! Point-kinetics reactor model.
//!
//! ```text
//! dn/dt   = ((rho - beta) / Lambda) n + sum_i lambda_i c_i + S
//! dc_i/dt = (beta_i / Lambda) n - lambda_i c_i
//! ```

pub mod engine;
pub mod solver;

pub use engine::{ReactorSimulator, SimulationEngine, StepInputs, StepOutcome};
pub use solver::{DormandPrince, SolverError, StepStats, Tolerances};

use serde::{Deserialize, Serialize};

use crate::config::KineticsParams;

pub const PRECURSOR_GROUPS: usize = 6;
/// Neutron density followed by the precursor groups.
pub const STATE_LEN: usize = PRECURSOR_GROUPS + 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactorState {
    pub n: f64,
    pub c: [f64; PRECURSOR_GROUPS],
    pub rho: f64,
    /// Simulated seconds since the last reset.
    pub t: f64,
}

impl ReactorState {
    /// Fresh-start conditions: `n = n0`, no precursors, `t = 0`.
    pub fn initial(n0: f64) -> Self {
        Self {
            n: n0,
            c: [0.0; PRECURSOR_GROUPS],
            rho: 0.0,
            t: 0.0,
        }
    }

    /// Critical steady state at zero reactivity: every precursor group in
    /// balance with `n0`.
    pub fn equilibrium(params: &KineticsParams) -> Self {
        let mut c = [0.0; PRECURSOR_GROUPS];
        for (i, ci) in c.iter_mut().enumerate() {
            *ci = params.beta[i] / (params.lambda[i] * params.generation_time) * params.n0;
        }
        Self {
            n: params.n0,
            c,
            rho: 0.0,
            t: 0.0,
        }
    }

    pub fn to_vector(&self) -> [f64; STATE_LEN] {
        let mut y = [0.0; STATE_LEN];
        y[0] = self.n;
        y[1..].copy_from_slice(&self.c);
        y
    }

    pub fn from_vector(y: &[f64; STATE_LEN], rho: f64, t: f64) -> Self {
        let mut c = [0.0; PRECURSOR_GROUPS];
        c.copy_from_slice(&y[1..]);
        Self { n: y[0], c, rho, t }
    }
}

/// Right-hand side of the point-kinetics system.
#[derive(Debug, Clone, Copy)]
pub struct PointKinetics {
    params: KineticsParams,
    beta_total: f64,
}

impl PointKinetics {
    pub fn new(params: KineticsParams) -> Self {
        Self {
            beta_total: params.beta_total(),
            params,
        }
    }

    pub fn params(&self) -> &KineticsParams {
        &self.params
    }

    pub fn beta_total(&self) -> f64 {
        self.beta_total
    }

    pub fn derivative(&self, y: &[f64; STATE_LEN], rho: f64, source: f64) -> [f64; STATE_LEN] {
        let p = &self.params;
        let n = y[0];
        let mut dy = [0.0; STATE_LEN];

        let mut delayed = 0.0;
        for i in 0..PRECURSOR_GROUPS {
            let c = y[i + 1];
            delayed += p.lambda[i] * c;
            dy[i + 1] = p.beta[i] / p.generation_time * n - p.lambda[i] * c;
        }
        dy[0] = (rho - self.beta_total) / p.generation_time * n + delayed + source;
        dy
    }
}

//! Adaptive Dormand–Prince 5(4) integrator.
//!
//! Fixed-size state vectors (`[f64; N]`) keep the hot loop allocation free.
//! The step size is chosen from the embedded 4th-order error estimate with a
//! mixed absolute/relative tolerance; a step that would have to shrink below
//! `min_step` is reported as [`SolverError::StepSizeCollapse`].

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SolverError {
    #[error("step size collapsed to {step:e} s at t = {t}")]
    StepSizeCollapse { t: f64, step: f64 },

    #[error("non-finite state at t = {t}")]
    NonFinite { t: f64 },

    #[error("negative state component {index} = {value:e} at t = {t}")]
    NegativeState { t: f64, index: usize, value: f64 },

    #[error("exceeded {limit} sub-steps before reaching t = {target}")]
    TooManySteps { target: f64, limit: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
    pub min_step: f64,
    pub max_substeps: u32,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-8,
            min_step: 1e-10,
            max_substeps: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub accepted: u32,
    pub rejected: u32,
}

// Butcher tableau.
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights (also row 7 of the tableau, FSAL).
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// Difference between 5th- and 4th-order weights.
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct DormandPrince {
    tol: Tolerances,
    /// Step size carried between calls so consecutive intervals start warm.
    h: Option<f64>,
    stats: StepStats,
}

impl DormandPrince {
    pub fn new(tol: Tolerances) -> Self {
        Self {
            tol,
            h: None,
            stats: StepStats::default(),
        }
    }

    pub fn stats(&self) -> StepStats {
        self.stats
    }

    /// Forget the carried step size, e.g. after the state is reset.
    pub fn reset(&mut self) {
        self.h = None;
    }

    /// Integrate `y' = f(t, y)` from `t0` to `t1`, returning `y(t1)`.
    pub fn integrate<const N: usize, F>(
        &mut self,
        mut f: F,
        t0: f64,
        y0: [f64; N],
        t1: f64,
    ) -> Result<[f64; N], SolverError>
    where
        F: FnMut(f64, &[f64; N]) -> [f64; N],
    {
        let mut t = t0;
        let mut y = y0;
        if t1 <= t0 {
            return Ok(y);
        }

        let mut k1 = f(t, &y);
        let mut h = match self.h {
            Some(h) => h,
            None => self.initial_step(&mut f, t, &y, &k1, t1 - t0),
        };
        let mut substeps = 0u32;

        while t < t1 {
            if substeps >= self.tol.max_substeps {
                return Err(SolverError::TooManySteps {
                    target: t1,
                    limit: self.tol.max_substeps,
                });
            }
            substeps += 1;

            if h < self.tol.min_step {
                return Err(SolverError::StepSizeCollapse { t, step: h });
            }
            // Land exactly on t1 without remembering the truncated step.
            let last = t + h >= t1;
            let h_try = if last { t1 - t } else { h };

            let (y_new, k7, err) = Self::try_step(&mut f, t, &y, &k1, h_try);
            let err_norm = self.error_norm(&y, &y_new, &err);

            if !err_norm.is_finite() || y_new.iter().any(|v| !v.is_finite()) {
                self.stats.rejected += 1;
                h = h_try * MIN_FACTOR;
                if h < self.tol.min_step {
                    return Err(SolverError::NonFinite { t });
                }
                continue;
            }

            if err_norm <= 1.0 {
                self.stats.accepted += 1;
                t = if last { t1 } else { t + h_try };
                y = y_new;
                k1 = k7;
                let factor = if err_norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err_norm.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                if !last {
                    h = h_try * factor;
                } else {
                    h = h.max(h_try * factor);
                }
            } else {
                self.stats.rejected += 1;
                h = h_try * (SAFETY * err_norm.powf(-0.2)).max(MIN_FACTOR);
            }
        }

        self.h = Some(h);
        Ok(y)
    }

    fn try_step<const N: usize, F>(
        f: &mut F,
        t: f64,
        y: &[f64; N],
        k1: &[f64; N],
        h: f64,
    ) -> ([f64; N], [f64; N], [f64; N])
    where
        F: FnMut(f64, &[f64; N]) -> [f64; N],
    {
        let stage = |weights: &[(f64, &[f64; N])]| {
            let mut out = *y;
            for (i, v) in out.iter_mut().enumerate() {
                let mut acc = 0.0;
                for (w, k) in weights {
                    acc += w * k[i];
                }
                *v += h * acc;
            }
            out
        };

        let k2 = f(t + C2 * h, &stage(&[(A21, k1)]));
        let k3 = f(t + C3 * h, &stage(&[(A31, k1), (A32, &k2)]));
        let k4 = f(t + C4 * h, &stage(&[(A41, k1), (A42, &k2), (A43, &k3)]));
        let k5 = f(
            t + C5 * h,
            &stage(&[(A51, k1), (A52, &k2), (A53, &k3), (A54, &k4)]),
        );
        let k6 = f(
            t + h,
            &stage(&[(A61, k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)]),
        );
        let y_new = stage(&[(B1, k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)]);
        let k7 = f(t + h, &y_new);

        let mut err = [0.0; N];
        for (i, e) in err.iter_mut().enumerate() {
            *e = h
                * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
        }
        (y_new, k7, err)
    }

    /// RMS of the error scaled by `atol + rtol * max(|y|, |y_new|)`.
    fn error_norm<const N: usize>(&self, y: &[f64; N], y_new: &[f64; N], err: &[f64; N]) -> f64 {
        if N == 0 {
            return 0.0;
        }
        let sum: f64 = (0..N)
            .map(|i| {
                let scale = self.tol.atol + self.tol.rtol * y[i].abs().max(y_new[i].abs());
                (err[i] / scale).powi(2)
            })
            .sum();
        (sum / N as f64).sqrt()
    }

    /// Hairer–Wanner starting step heuristic.
    fn initial_step<const N: usize, F>(
        &self,
        f: &mut F,
        t: f64,
        y: &[f64; N],
        f0: &[f64; N],
        span: f64,
    ) -> f64
    where
        F: FnMut(f64, &[f64; N]) -> [f64; N],
    {
        let scale = |i: usize| self.tol.atol + self.tol.rtol * y[i].abs();
        let rms = |v: &dyn Fn(usize) -> f64| {
            ((0..N).map(|i| v(i).powi(2)).sum::<f64>() / N.max(1) as f64).sqrt()
        };

        let d0 = rms(&|i| y[i] / scale(i));
        let d1 = rms(&|i| f0[i] / scale(i));
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        let h0 = h0.min(span);

        let mut y1 = *y;
        for i in 0..N {
            y1[i] += h0 * f0[i];
        }
        let f1 = f(t + h0, &y1);
        let d2 = rms(&|i| (f1[i] - f0[i]) / scale(i)) / h0;

        let h1 = if d1.max(d2) <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(0.2)
        };
        (100.0 * h0).min(h1).min(span).max(self.tol.min_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_decay_matches_analytic() {
        let mut solver = DormandPrince::new(Tolerances::default());
        let k = 3.0;
        let y = solver
            .integrate(|_, y: &[f64; 1]| [-k * y[0]], 0.0, [1.0], 2.0)
            .unwrap();
        assert!((y[0] - (-k * 2.0f64).exp()).abs() < 1e-6);
    }

    #[test]
    fn test_harmonic_oscillator_conserves_phase() {
        let mut solver = DormandPrince::new(Tolerances {
            rtol: 1e-9,
            atol: 1e-12,
            ..Tolerances::default()
        });
        let y = solver
            .integrate(
                |_, y: &[f64; 2]| [y[1], -y[0]],
                0.0,
                [1.0, 0.0],
                std::f64::consts::PI,
            )
            .unwrap();
        assert!((y[0] + 1.0).abs() < 1e-7);
        assert!(y[1].abs() < 1e-7);
    }

    #[test]
    fn test_step_size_adapts_to_stiffness() {
        let mut loose = DormandPrince::new(Tolerances::default());
        loose
            .integrate(|_, y: &[f64; 1]| [-1.0 * y[0]], 0.0, [1.0], 1.0)
            .unwrap();

        let mut stiff = DormandPrince::new(Tolerances::default());
        stiff
            .integrate(|_, y: &[f64; 1]| [-200.0 * y[0]], 0.0, [1.0], 1.0)
            .unwrap();

        assert!(stiff.stats().accepted > loose.stats().accepted);
    }

    #[test]
    fn test_empty_interval_is_identity() {
        let mut solver = DormandPrince::new(Tolerances::default());
        let y = solver
            .integrate(|_, y: &[f64; 1]| [y[0]], 1.0, [4.0], 1.0)
            .unwrap();
        assert_eq!(y, [4.0]);
        assert_eq!(solver.stats().accepted, 0);
    }

    #[test]
    fn test_finite_time_blowup_collapses_step() {
        // y' = y^2 with y(0) = 1 diverges at t = 1.
        let mut solver = DormandPrince::new(Tolerances {
            min_step: 1e-9,
            max_substeps: 1_000_000,
            ..Tolerances::default()
        });
        let result = solver.integrate(|_, y: &[f64; 1]| [y[0] * y[0]], 0.0, [1.0], 2.0);
        assert!(matches!(
            result,
            Err(SolverError::StepSizeCollapse { .. }) | Err(SolverError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_substep_budget_enforced() {
        let mut solver = DormandPrince::new(Tolerances {
            max_substeps: 3,
            ..Tolerances::default()
        });
        let result = solver.integrate(|_, y: &[f64; 1]| [-500.0 * y[0]], 0.0, [1.0], 10.0);
        assert!(matches!(result, Err(SolverError::TooManySteps { .. })));
    }
}

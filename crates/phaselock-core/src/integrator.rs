//! Full-system fourth-order Runge-Kutta over the slot array.
//!
//! The right-hand side for slot `i` is
//!
//! ```text
//! dA_i/dt = -i H_i A_i + gamma (1 - |A_i|^2) A_i + sum_j kappa_ij (A_j - A_i)
//! kappa_ij = K exp(-min(|1 - A_j / A_i|, 50))
//! ```
//!
//! Every stage reads a fully materialized input buffer and writes a
//! separate derivative buffer. Stage `s + 1` inputs are only built once
//! every stage `s` derivative exists, so slot `i` never sees a half-updated
//! neighbor. With `parallel` set, each fill runs on the rayon pool; the
//! per-slot arithmetic is identical either way, so both paths produce the
//! same bits.

use rayon::prelude::*;

use phaselock_types::{Amplitude, NumericValue};

use crate::topology::Topology;

/// Magnitude floor used before dividing by a slot amplitude.
pub const EPSILON: f64 = 1e-10;

/// Upper clamp on the coupling distance fed to `exp`.
pub const COUPLING_DISTANCE_CLAMP: f64 = 50.0;

/// Dynamics constants converted to the engine's numeric type.
#[derive(Debug, Clone, Copy)]
pub struct Dynamics<N> {
    /// Restoring gain `gamma`.
    pub gamma: N,
    /// Coupling strength `K`.
    pub k_coupling: N,
    /// Division floor.
    pub epsilon: N,
    /// Clamp on `|1 - A_j / A_i|`.
    pub distance_clamp: N,
}

impl<N: NumericValue> Dynamics<N> {
    /// Build from `f64` constants.
    pub fn new(gamma: f64, k_coupling: f64) -> Self {
        Self {
            gamma: N::from_f64(gamma),
            k_coupling: N::from_f64(k_coupling),
            epsilon: N::from_f64(EPSILON),
            distance_clamp: N::from_f64(COUPLING_DISTANCE_CLAMP),
        }
    }
}

/// One slot's time derivative and whether its division was floored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Derivative<N> {
    /// `dA/dt`.
    pub value: Amplitude<N>,
    /// Whether `|A_i|` was below epsilon in a coupling division.
    pub floored: bool,
}

impl<N: NumericValue> Derivative<N> {
    fn zero() -> Self {
        Self {
            value: Amplitude::zero(),
            floored: false,
        }
    }
}

/// Evaluate `dA_i/dt` for one slot against a stage input buffer.
#[allow(clippy::arithmetic_side_effects)]
pub fn slot_derivative<N: NumericValue>(
    index: usize,
    inputs: &[Amplitude<N>],
    topology: &Topology,
    frequency: N,
    dynamics: &Dynamics<N>,
) -> Derivative<N> {
    let Some(&a_i) = inputs.get(index) else {
        return Derivative::zero();
    };

    let rotation = a_i.mul_i().scale(-frequency);
    let restoring = a_i.scale(dynamics.gamma * (N::one() - a_i.norm_sqr()));

    let mut coupling = Amplitude::zero();
    let mut floored = false;
    if let Some(neighbors) = topology.neighbors(index) {
        let unit = Amplitude::new(N::one(), N::zero());
        for &j in neighbors.as_slice() {
            let Some(&a_j) = inputs.get(j as usize) else {
                continue;
            };
            let (ratio, was_floored) = a_j.div_floored(a_i, dynamics.epsilon);
            floored |= was_floored;
            let distance = (unit - ratio).magnitude().min_of(dynamics.distance_clamp);
            let kappa = dynamics.k_coupling * (-distance).exp();
            coupling = coupling + (a_j - a_i).scale(kappa);
        }
    }

    Derivative {
        value: rotation + restoring + coupling,
        floored,
    }
}

/// Scratch buffers for one RK4 step, reused across steps.
#[derive(Debug, Clone)]
pub struct Rk4Workspace<N> {
    stage: Vec<Amplitude<N>>,
    k1: Vec<Derivative<N>>,
    k2: Vec<Derivative<N>>,
    k3: Vec<Derivative<N>>,
    k4: Vec<Derivative<N>>,
}

/// Result of integrating one slot over one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Integrated<N> {
    /// `y_{n+1}` before any damping.
    pub amplitude: Amplitude<N>,
    /// Whether any stage floored this slot's division.
    pub floored: bool,
}

impl<N: NumericValue> Rk4Workspace<N> {
    /// Allocate buffers for `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            stage: vec![Amplitude::zero(); len],
            k1: vec![Derivative::zero(); len],
            k2: vec![Derivative::zero(); len],
            k3: vec![Derivative::zero(); len],
            k4: vec![Derivative::zero(); len],
        }
    }

    /// Advance `y` by `dt` and write `y_{n+1}` into `out`.
    ///
    /// `y` is the committed previous-step buffer and is never modified.
    /// `out` must have the same length as `y`.
    #[allow(clippy::arithmetic_side_effects, clippy::too_many_arguments)]
    pub fn integrate(
        &mut self,
        y: &[Amplitude<N>],
        dt: N,
        topology: &Topology,
        frequencies: &[N],
        dynamics: &Dynamics<N>,
        parallel: bool,
        out: &mut [Integrated<N>],
    ) {
        let two = N::one() + N::one();
        let half_dt = dt / two;
        let sixth_dt = dt / N::from_f64(6.0);
        let frequency = |i: usize| frequencies.get(i).copied().unwrap_or_else(N::zero);

        // k1 = f(y)
        fill(&mut self.k1, parallel, |i| {
            slot_derivative(i, y, topology, frequency(i), dynamics)
        });

        // k2 = f(y + dt/2 k1)
        advance(&mut self.stage, y, &self.k1, half_dt, parallel);
        let stage = &self.stage;
        fill(&mut self.k2, parallel, |i| {
            slot_derivative(i, stage, topology, frequency(i), dynamics)
        });

        // k3 = f(y + dt/2 k2)
        advance(&mut self.stage, y, &self.k2, half_dt, parallel);
        let stage = &self.stage;
        fill(&mut self.k3, parallel, |i| {
            slot_derivative(i, stage, topology, frequency(i), dynamics)
        });

        // k4 = f(y + dt k3)
        advance(&mut self.stage, y, &self.k3, dt, parallel);
        let stage = &self.stage;
        fill(&mut self.k4, parallel, |i| {
            slot_derivative(i, stage, topology, frequency(i), dynamics)
        });

        let (k1, k2, k3, k4) = (&self.k1, &self.k2, &self.k3, &self.k4);
        fill(out, parallel, |i| {
            let (Some(y_i), Some(d1), Some(d2), Some(d3), Some(d4)) =
                (y.get(i), k1.get(i), k2.get(i), k3.get(i), k4.get(i))
            else {
                return Integrated {
                    amplitude: Amplitude::zero(),
                    floored: false,
                };
            };
            let slope = d1.value + d2.value.scale(two) + d3.value.scale(two) + d4.value;
            Integrated {
                amplitude: *y_i + slope.scale(sixth_dt),
                floored: d1.floored || d2.floored || d3.floored || d4.floored,
            }
        });
    }
}

/// Materialize `stage[i] = y[i] + h * k[i]` for every slot.
fn advance<N: NumericValue>(
    stage: &mut [Amplitude<N>],
    y: &[Amplitude<N>],
    k: &[Derivative<N>],
    h: N,
    parallel: bool,
) {
    fill(stage, parallel, |i| match (y.get(i), k.get(i)) {
        (Some(&y_i), Some(k_i)) => y_i + k_i.value.scale(h),
        _ => Amplitude::zero(),
    });
}

/// Write `f(i)` into every cell, on the rayon pool when `parallel` is set.
pub(crate) fn fill<T, F>(out: &mut [T], parallel: bool, f: F)
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if parallel {
        out.par_iter_mut()
            .enumerate()
            .for_each(|(i, cell)| *cell = f(i));
    } else {
        for (i, cell) in out.iter_mut().enumerate() {
            *cell = f(i);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn dynamics() -> Dynamics<f64> {
        Dynamics::new(0.02, 1.0)
    }

    #[test]
    fn isolated_slot_rotates_at_its_frequency() {
        // No neighbors, |A| = 1: only the -iH term acts.
        let topology = Topology::new(&[1]);
        let y = vec![Amplitude::new(1.0, 0.0)];
        let mut workspace = Rk4Workspace::new(1);
        let mut out = vec![
            Integrated {
                amplitude: Amplitude::zero(),
                floored: false
            };
            1
        ];
        let dt = 0.01;
        workspace.integrate(&y, dt, &topology, &[2.0], &dynamics(), false, &mut out);
        let a = out.first().unwrap().amplitude;
        // exp(-i * 2 * 0.01)
        assert!((a.re - (0.02_f64).cos()).abs() < 1e-9);
        assert!((a.im + (0.02_f64).sin()).abs() < 1e-9);
    }

    #[test]
    fn identical_neighbors_do_not_couple() {
        let topology = Topology::new(&[2]);
        let y = vec![Amplitude::new(1.0, 0.0); 2];
        let d = slot_derivative(0, &y, &topology, 0.0, &dynamics());
        assert_eq!(d.value, Amplitude::new(0.0, 0.0));
        assert!(!d.floored);
    }

    #[test]
    fn coupling_pulls_toward_neighbor() {
        let topology = Topology::new(&[2]);
        let y = vec![Amplitude::new(1.0, 0.0), Amplitude::new(0.0, 1.0)];
        let d = slot_derivative(0, &y, &topology, 0.0, &dynamics());
        // A_1 - A_0 = (-1, 1); kappa = exp(-|1 - i|) = exp(-sqrt 2).
        let kappa = (-(2.0_f64).sqrt()).exp();
        assert!((d.value.re + kappa).abs() < 1e-12);
        assert!((d.value.im - kappa).abs() < 1e-12);
    }

    #[test]
    fn zero_amplitude_is_floored() {
        let topology = Topology::new(&[2]);
        let y = vec![Amplitude::zero(), Amplitude::new(1.0, 0.0)];
        let d = slot_derivative(0, &y, &topology, 0.0, &dynamics());
        assert!(d.floored);
        assert!(d.value.is_finite());
    }

    #[test]
    fn parallel_matches_sequential() {
        let topology = Topology::new(&[16, 16]);
        let y: Vec<Amplitude<f64>> = (0..256)
            .map(|i| {
                let theta = f64::from(i) * 0.37;
                Amplitude::from_polar(1.0, theta)
            })
            .collect();
        let freqs: Vec<f64> = (0..256).map(|i| 1.0 + f64::from(i) * 1e-3).collect();
        let blank = Integrated {
            amplitude: Amplitude::zero(),
            floored: false,
        };

        let mut seq = vec![blank; 256];
        let mut par = vec![blank; 256];
        Rk4Workspace::new(256).integrate(&y, 1e-3, &topology, &freqs, &dynamics(), false, &mut seq);
        Rk4Workspace::new(256).integrate(&y, 1e-3, &topology, &freqs, &dynamics(), true, &mut par);

        for (a, b) in seq.iter().zip(&par) {
            assert_eq!(a.amplitude.re.to_bits(), b.amplitude.re.to_bits());
            assert_eq!(a.amplitude.im.to_bits(), b.amplitude.im.to_bits());
        }
    }

    #[test]
    fn input_buffer_is_untouched() {
        let topology = Topology::new(&[8]);
        let y: Vec<Amplitude<f64>> = (0..8)
            .map(|i| Amplitude::from_polar(1.0, f64::from(i)))
            .collect();
        let before = y.clone();
        let mut out = vec![
            Integrated {
                amplitude: Amplitude::zero(),
                floored: false
            };
            8
        ];
        Rk4Workspace::new(8).integrate(&y, 1e-3, &topology, &[1.0; 8], &dynamics(), false, &mut out);
        assert_eq!(y, before);
    }
}

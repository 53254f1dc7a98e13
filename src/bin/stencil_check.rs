// src/bin/stencil_check.rs
//
// Accuracy of both stencil policies on an analytic periodic potential.
//
//   phi(x, y, z) = sin(q x) * sin(q y) * cos(q z),   q = 2 pi m / L
//
// Samples are scattered over the box, their footprints gathered exactly as the
// projector does, and every interpolated derivative is compared with the
// analytic one. Errors should fall as dl^2 when `n` doubles.
//
// Run:
//   cargo run --release --bin stencil_check -- n=32 m=2 samples=200
//
// Output (stdout):
//   one row per (policy, derivative): max abs error, RMS error, scale

use std::env;
use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use lenspot::grid::Grid3D;
use lenspot::gridcell_hash::GridCellHash;
use lenspot::stencil::{
    Derivative, GRADIENT, HESSIAN, StencilPolicy, derivative_field, insert_footprint, interpolate,
};

const BOX: f64 = 100.0;

struct Field {
    q: f64,
}

impl Field {
    fn trig(&self, x: f64, a: usize, order: usize) -> f64 {
        // d^order/dx^order of sin (axes 0, 1) or cos (axis 2)
        let phase = self.q * x + if a == 2 { PI / 2.0 } else { 0.0 };
        let v = match order % 4 {
            0 => phase.sin(),
            1 => phase.cos(),
            2 => -phase.sin(),
            _ => -phase.cos(),
        };
        v * self.q.powi(order as i32)
    }

    fn eval(&self, p: [f64; 3], d: Derivative) -> f64 {
        let mut order = [0usize; 3];
        match d {
            Derivative::Potential => {}
            Derivative::First(a) => order[a] += 1,
            Derivative::Second(a, b) => {
                order[a] += 1;
                order[b] += 1;
            }
        }
        (0..3).map(|a| self.trig(p[a], a, order[a])).product()
    }
}

fn label(d: Derivative) -> String {
    const AX: [&str; 3] = ["x", "y", "z"];
    match d {
        Derivative::Potential => "phi".to_string(),
        Derivative::First(a) => format!("d{}", AX[a]),
        Derivative::Second(a, b) => format!("d{}d{}", AX[a], AX[b]),
    }
}

fn main() {
    let mut n: usize = 32;
    let mut m: usize = 2;
    let mut samples: usize = 200;
    for arg in env::args().skip(1) {
        if let Some(v) = arg.strip_prefix("n=") {
            n = v.parse().unwrap_or(n);
        } else if let Some(v) = arg.strip_prefix("m=") {
            m = v.parse().unwrap_or(m);
        } else if let Some(v) = arg.strip_prefix("samples=") {
            samples = v.parse().unwrap_or(samples);
        } else {
            eprintln!("Warning: ignoring argument '{arg}'");
        }
    }

    let grid = Grid3D::new(n, BOX);
    let field = Field {
        q: 2.0 * PI * m as f64 / BOX,
    };

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let points: Vec<[f64; 3]> = (0..samples)
        .map(|_| [0; 3].map(|_| rng.random::<f64>() * BOX))
        .collect();

    let mut hash = GridCellHash::new();
    for &p in &points {
        insert_footprint(&mut hash, &grid, p);
    }
    hash.sort_by_id();
    for c in hash.cells_mut() {
        let [i, j, k] = grid.ijk(c.id);
        let pos = [i, j, k].map(|v| v as f64 * grid.dl);
        c.val = field.eval(pos, Derivative::Potential);
    }

    println!(
        "n = {}, dl = {:.4}, q dl = {:.4}, {} samples, {} gathered vertices",
        n,
        grid.dl,
        field.q * grid.dl,
        samples,
        hash.len()
    );
    println!("{:<10} {:<6} {:>12} {:>12} {:>12}", "policy", "deriv", "max_abs", "rms", "scale");

    let derivs: Vec<Derivative> = std::iter::once(Derivative::Potential)
        .chain(GRADIENT)
        .chain(HESSIAN)
        .collect();
    for policy in [StencilPolicy::Staggered, StencilPolicy::Centered] {
        for &d in &derivs {
            let values = derivative_field(&hash, &grid, policy, d);
            let shifted = d.shifted_axes(policy);
            let mut max_abs: f64 = 0.0;
            let mut sum_sq = 0.0;
            for &p in &points {
                let got = interpolate(&hash, &values, &grid, p, shifted);
                let err = got - field.eval(p, d);
                max_abs = max_abs.max(err.abs());
                sum_sq += err * err;
            }
            let scale = field.q.powi(match d {
                Derivative::Potential => 0,
                Derivative::First(_) => 1,
                Derivative::Second(..) => 2,
            });
            println!(
                "{:<10} {:<6} {:>12.4e} {:>12.4e} {:>12.4e}",
                policy.name(),
                label(d),
                max_abs,
                (sum_sq / samples.max(1) as f64).sqrt(),
                scale
            );
        }
    }
}

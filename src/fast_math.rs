use ndarray::{Array2, Axis};
use ndarray::parallel::prelude::*;
use std::f32::consts::LOG2_E;

const INVERSE_LOG2_E: f32 = 1. / LOG2_E;

const COEFF_0: f32 = 1.0;
const COEFF_1: f32 = 4.831794110;
const COEFF_2: f32 = 0.143440676;
const COEFF_3: f32 = 0.019890581;
const COEFF_4: f32 = 0.006935931;
const ONEBYLOG2: f32 = 1.442695041;
const OFFSET_F64: i64 = 1023;
const FRACTION_F64: u32 = 52;
const MIN_VAL: f32 = -500.0;

/// Fast approximation of exp() as shown by Kopcynski 2017:
/// https://eldorado.tu-dortmund.de/bitstream/2003/36203/1/Dissertation_Kopczynski.pdf
#[cfg(feature = "fastexp")]
pub fn fast_exp(input: f32) -> f32 {
    if input > MIN_VAL {
        let mut x = ONEBYLOG2 * input;

        // 2^int(x) assembled straight into f64 exponent bits
        #[repr(C)]
        union F1 {
            i: i64,
            f: f64,
        }
        let mut f1 = F1 { i: x as i64 };

        x -= unsafe { f1.i } as f32;
        let mut f2 = x;
        let mut x_tmp = x;

        unsafe {
            f1.i += OFFSET_F64;
            f1.i <<= FRACTION_F64;
        }

        f2 *= COEFF_4;
        x_tmp += COEFF_1;
        f2 += COEFF_3;
        x_tmp *= x;
        f2 *= x;
        f2 += COEFF_2;
        f2 *= x_tmp;
        f2 += COEFF_0;

        (unsafe { f1.f } * f2 as f64) as f32
    } else {
        0.0
    }
}

#[cfg(not(feature = "fastexp"))]
pub fn fast_exp(input: f32) -> f32 {
    if input > MIN_VAL {
        input.exp()
    } else {
        0.0
    }
}

#[inline]
pub fn fast_log(x: f32) -> f32 {
    x.log2() * INVERSE_LOG2_E
}

/// Mass merge of two log-domain scores. Inactive (-inf) inputs pass through.
pub fn logsumexp_2(x: f32, y: f32) -> f32 {
    if x == f32::NEG_INFINITY {
        return y;
    }
    if y == f32::NEG_INFINITY {
        return x;
    }
    if x < y {
        y + fast_log(fast_exp(x - y) + 1.0)
    } else {
        x + fast_log(fast_exp(y - x) + 1.0)
    }
}

#[inline]
pub fn logsumexp(xs: &[f32], max: f32) -> f32 {
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    fast_log(xs.iter().fold(0., |acc, &x| acc + fast_exp(x - max))) + max
}

/// Log-softmax over the last axis, in place, one rayon task per row.
/// Rows that are entirely -inf are left untouched.
pub fn log_softmax_rows(logits: &mut Array2<f32>) {
    logits
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let mut max = f32::NEG_INFINITY;
            for &x in row.iter() {
                if x > max {
                    max = x;
                }
            }
            if max == f32::NEG_INFINITY {
                return;
            }
            let mut acc = 0.;
            for &x in row.iter() {
                acc += fast_exp(x - max);
            }
            let log_z = fast_log(acc) + max;
            for x in row.iter_mut() {
                *x -= log_z;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn fast_exp_tracks_std_exp() {
        for i in -40..40 {
            let x = i as f32 * 0.5;
            let got = fast_exp(x);
            let want = x.exp();
            assert!(
                (got - want).abs() <= 1e-2 * want.max(1e-6),
                "exp({}) = {} vs {}",
                x,
                got,
                want
            );
        }
        assert_eq!(fast_exp(-600.0), 0.0);
        assert_eq!(fast_exp(f32::NEG_INFINITY), 0.0);
    }

    #[test]
    fn logsumexp_2_handles_inactive_scores() {
        assert_eq!(logsumexp_2(f32::NEG_INFINITY, -1.5), -1.5);
        assert_eq!(logsumexp_2(-1.5, f32::NEG_INFINITY), -1.5);
        assert_eq!(
            logsumexp_2(f32::NEG_INFINITY, f32::NEG_INFINITY),
            f32::NEG_INFINITY
        );
        // two equal masses double: x + ln 2
        let got = logsumexp_2(-0.7, -0.7);
        assert!((got - (-0.7 + std::f32::consts::LN_2)).abs() < 1e-2);
    }

    #[test]
    fn logsumexp_matches_direct_sum() {
        let xs = [-1.0f32, -2.0, -0.5, f32::NEG_INFINITY];
        let max = -0.5;
        let got = logsumexp(&xs, max);
        let want = xs.iter().map(|x| x.exp()).sum::<f32>().ln();
        assert!((got - want).abs() < 1e-2);
        assert_eq!(
            logsumexp(&[f32::NEG_INFINITY; 3], f32::NEG_INFINITY),
            f32::NEG_INFINITY
        );
    }

    #[test]
    fn log_softmax_rows_normalizes_each_row() {
        let mut a = arr2(&[[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        log_softmax_rows(&mut a);
        for row in a.rows() {
            let mass: f32 = row.iter().map(|x| x.exp()).sum();
            assert!((mass - 1.0).abs() < 1e-2, "row mass {}", mass);
        }
        let mut inert = arr2(&[[f32::NEG_INFINITY, f32::NEG_INFINITY]]);
        log_softmax_rows(&mut inert);
        assert_eq!(inert[[0, 0]], f32::NEG_INFINITY);
    }
}

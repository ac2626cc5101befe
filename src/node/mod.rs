//! Built-in processors exercising the render contract.
use std::f32::consts::PI;

use lazy_static::lazy_static;

mod delay;
pub use delay::*;
mod gain;
pub use gain::*;
mod oscillator;
pub use oscillator::*;
mod sink;
pub use sink::*;
mod tap;
pub use tap::*;

const TABLE_LENGTH_USIZE: usize = 2048;
const TABLE_MASK: usize = TABLE_LENGTH_USIZE - 1;
// 2048 casts without loss of precision cause its mantissa is 0b0
#[allow(clippy::cast_precision_loss)]
const TABLE_LENGTH_F64: f64 = TABLE_LENGTH_USIZE as f64;

// Compute one period sine wavetable of size TABLE_LENGTH
lazy_static! {
    static ref SINETABLE: Vec<f32> = {
        #[allow(clippy::cast_precision_loss)]
        // 0 through 2048 are cast without loss of precision
        let table: Vec<f32> = (0..TABLE_LENGTH_USIZE)
            .map(|x| ((x as f32) * 2.0 * PI * (1. / (TABLE_LENGTH_USIZE as f32))).sin())
            .collect();
        table
    };
}

/// Linearly interpolated sine lookup; `phase` in turns (one turn per cycle).
pub(crate) fn sine(phase: f64) -> f32 {
    let position = phase.rem_euclid(1.) * TABLE_LENGTH_F64;
    let index = position as usize;
    let frac = (position - index as f64) as f32;
    let a = SINETABLE[index & TABLE_MASK];
    let b = SINETABLE[(index + 1) & TABLE_MASK];
    a + (b - a) * frac
}

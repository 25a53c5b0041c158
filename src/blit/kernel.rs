//! Reconstruction kernels.
//!
//! A kernel is evaluated in its own units; the blit scales the support by
//! the per-axis `in / out` ratio before sampling it.

use std::f32::consts::PI;
use std::fmt::Debug;

/// 1D reconstruction filter.
pub trait Kernel: Debug + Send + Sync {
    /// Support `[negative, positive]` in kernel units.
    fn support(&self) -> (f32, f32);

    /// Weight at `x`. Zero outside the support.
    fn weight(&self, x: f32) -> f32;

    fn name(&self) -> &'static str;
}

/// Nearest-texel box, support `[-1/2, 1/2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoxKernel;

impl Kernel for BoxKernel {
    fn support(&self) -> (f32, f32) {
        (-0.5, 0.5)
    }

    #[inline]
    fn weight(&self, x: f32) -> f32 {
        if (-0.5..0.5).contains(&x) { 1.0 } else { 0.0 }
    }

    fn name(&self) -> &'static str {
        "box"
    }
}

/// Tent filter, support `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriangleKernel;

impl Kernel for TriangleKernel {
    fn support(&self) -> (f32, f32) {
        (-1.0, 1.0)
    }

    #[inline]
    fn weight(&self, x: f32) -> f32 {
        (1.0 - x.abs()).max(0.0)
    }

    fn name(&self) -> &'static str {
        "triangle"
    }
}

/// Windowed sinc with `lobes` lobes on each side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LanczosKernel {
    pub lobes: u32,
}

impl Default for LanczosKernel {
    fn default() -> Self {
        Self { lobes: 3 }
    }
}

#[inline]
fn sinc(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

impl Kernel for LanczosKernel {
    fn support(&self) -> (f32, f32) {
        let a = self.lobes.max(1) as f32;
        (-a, a)
    }

    #[inline]
    fn weight(&self, x: f32) -> f32 {
        let a = self.lobes.max(1) as f32;
        if x.abs() >= a {
            return 0.0;
        }
        sinc(x) * sinc(x / a)
    }

    fn name(&self) -> &'static str {
        "lanczos"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_is_half_open() {
        assert_eq!(BoxKernel.weight(-0.5), 1.0);
        assert_eq!(BoxKernel.weight(0.5), 0.0);
        assert_eq!(BoxKernel.weight(0.0), 1.0);
    }

    #[test]
    fn test_triangle_and_lanczos_vanish_at_integers() {
        assert_eq!(TriangleKernel.weight(1.0), 0.0);
        assert!((TriangleKernel.weight(0.25) - 0.75).abs() < 1e-6);
        let l = LanczosKernel::default();
        assert!((l.weight(0.0) - 1.0).abs() < 1e-6);
        for k in 1..3 {
            assert!(l.weight(k as f32).abs() < 1e-5);
        }
        assert_eq!(l.weight(3.0), 0.0);
        assert_eq!(l.support(), (-3.0, 3.0));
    }
}

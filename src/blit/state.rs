//! Filter state shared by the CPU and device paths.

use std::sync::Arc;

use crate::util::{Error, Extent3, Result};

use super::kernel::{BoxKernel, Kernel};

/// Addressing of taps outside the input region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirroredRepeat,
    ClampToBorder,
}

impl WrapMode {
    pub fn code(self) -> u32 {
        match self {
            Self::ClampToEdge => 0,
            Self::Repeat => 1,
            Self::MirroredRepeat => 2,
            Self::ClampToBorder => 3,
        }
    }

    /// Map tap `i` into `[0, n)`, or `None` for a border texel.
    #[inline]
    pub fn resolve(self, i: i32, n: u32) -> Option<u32> {
        let n = n as i32;
        match self {
            Self::ClampToEdge => Some(i.clamp(0, n - 1) as u32),
            Self::Repeat => Some(i.rem_euclid(n) as u32),
            Self::MirroredRepeat => {
                let period = 2 * n;
                let m = i.rem_euclid(period);
                Some(if m < n { m } else { period - 1 - m } as u32)
            }
            Self::ClampToBorder => (0..n).contains(&i).then_some(i as u32),
        }
    }
}

/// Color returned for [`WrapMode::ClampToBorder`] taps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum BorderColor {
    #[default]
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

impl BorderColor {
    pub fn rgba(self) -> [f32; 4] {
        match self {
            Self::TransparentBlack => [0.0; 4],
            Self::OpaqueBlack => [0.0, 0.0, 0.0, 1.0],
            Self::OpaqueWhite => [1.0; 4],
        }
    }
}

/// How alpha is treated by the blit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum AlphaSemantic {
    /// Alpha is filtered like any other channel.
    #[default]
    NonePremultiplied,
    /// Alpha is a coverage mask thresholded at the reference value. The
    /// output is renormalized to keep the same coverage.
    ReferenceOrCoverage,
}

/// Everything one blit needs except the images and the scratch memory.
#[derive(Debug, Clone)]
pub struct BlitState {
    pub input_extent: Extent3,
    pub output_extent: Extent3,
    pub kernels: [Arc<dyn Kernel>; 3],
    pub wrap: [WrapMode; 3],
    pub border: BorderColor,
    pub alpha_semantic: AlphaSemantic,
    pub reference_alpha: f32,
}

impl BlitState {
    /// Box-filtered blit with clamped edges.
    pub fn new(input_extent: Extent3, output_extent: Extent3) -> Self {
        let kernel: Arc<dyn Kernel> = Arc::new(BoxKernel);
        Self {
            input_extent,
            output_extent,
            kernels: [kernel.clone(), kernel.clone(), kernel],
            wrap: [WrapMode::ClampToEdge; 3],
            border: BorderColor::TransparentBlack,
            alpha_semantic: AlphaSemantic::NonePremultiplied,
            reference_alpha: 0.5,
        }
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.kernels = [kernel.clone(), kernel.clone(), kernel];
        self
    }

    pub fn with_wrap(mut self, wrap: WrapMode) -> Self {
        self.wrap = [wrap; 3];
        self
    }

    pub fn with_border(mut self, border: BorderColor) -> Self {
        self.border = border;
        self
    }

    pub fn with_coverage(mut self, reference_alpha: f32) -> Self {
        self.alpha_semantic = AlphaSemantic::ReferenceOrCoverage;
        self.reference_alpha = reference_alpha;
        self
    }

    pub fn coverage(&self) -> bool {
        self.alpha_semantic == AlphaSemantic::ReferenceOrCoverage
    }

    /// `in / out` per axis.
    pub fn scale(&self) -> [f64; 3] {
        let i = self.input_extent.to_array();
        let o = self.output_extent.to_array();
        [0, 1, 2].map(|a| i[a] as f64 / o[a] as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_extent.is_empty() || self.output_extent.is_empty() {
            return Err(Error::filter(format!(
                "empty region: input {:?}, output {:?}",
                self.input_extent, self.output_extent
            )));
        }
        for (axis, kernel) in self.kernels.iter().enumerate() {
            let (neg, pos) = kernel.support();
            if !(neg <= 0.0 && pos >= 0.0 && neg.is_finite() && pos.is_finite()) {
                return Err(Error::filter(format!("{} kernel on axis {axis} has support [{neg}, {pos}]", kernel.name())));
            }
        }
        if self.coverage() && !(0.0..1.0).contains(&self.reference_alpha) {
            return Err(Error::filter(format!("reference alpha {} outside [0, 1)", self.reference_alpha)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_modes() {
        assert_eq!(WrapMode::ClampToEdge.resolve(-3, 4), Some(0));
        assert_eq!(WrapMode::ClampToEdge.resolve(9, 4), Some(3));
        assert_eq!(WrapMode::Repeat.resolve(-1, 4), Some(3));
        assert_eq!(WrapMode::Repeat.resolve(5, 4), Some(1));
        // 0 1 2 3 | 3 2 1 0 | 0 1 ...
        assert_eq!(WrapMode::MirroredRepeat.resolve(4, 4), Some(3));
        assert_eq!(WrapMode::MirroredRepeat.resolve(-1, 4), Some(0));
        assert_eq!(WrapMode::MirroredRepeat.resolve(9, 4), Some(1));
        assert_eq!(WrapMode::ClampToBorder.resolve(-1, 4), None);
        assert_eq!(WrapMode::ClampToBorder.resolve(2, 4), Some(2));
    }

    #[test]
    fn test_reference_alpha_range() {
        let state = BlitState::new(Extent3::d2(4, 4), Extent3::d2(2, 2));
        assert!(state.clone().with_coverage(0.5).validate().is_ok());
        assert!(state.clone().with_coverage(1.0).validate().is_err());
        assert!(state.with_coverage(-0.1).validate().is_err());
        let empty = BlitState::new(Extent3::d2(0, 4), Extent3::d2(2, 2));
        assert!(matches!(empty.validate(), Err(Error::InvalidFilter(_))));
    }
}

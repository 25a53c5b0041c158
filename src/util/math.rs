//! Math type re-exports and small geometry helpers.
//!
//! This module re-exports types from `glam` and provides the bounding box,
//! ray and extent types shared by the acceleration structures and the blitter.

pub use glam::{Affine3A, Mat3, Mat3A, Mat4, UVec3, Vec2, Vec3, Vec3A, Vec4};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: [f32::INFINITY; 3],
        max: [f32::NEG_INFINITY; 3],
    };

    #[inline]
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Box around a sphere.
    #[inline]
    pub fn from_sphere(center: Vec3, radius: f32) -> Self {
        Self {
            min: (center - Vec3::splat(radius)).to_array(),
            max: (center + Vec3::splat(radius)).to_array(),
        }
    }

    /// Min greater than max on some axis (or NaN). Such primitives are inactive.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        (0..3).any(|i| !(self.min[i] <= self.max[i]))
    }

    /// Grow to include a point.
    #[inline]
    pub fn grow_point(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// Grow to include another AABB.
    #[inline]
    pub fn grow(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    /// Surface area (for SAH cost).
    #[inline]
    pub fn area(&self) -> f32 {
        let dx = self.max[0] - self.min[0];
        let dy = self.max[1] - self.min[1];
        let dz = self.max[2] - self.min[2];
        2.0 * (dx * dy + dy * dz + dz * dx)
    }

    /// Centroid of the AABB.
    #[inline]
    pub fn centroid(&self) -> [f32; 3] {
        [
            (self.min[0] + self.max[0]) * 0.5,
            (self.min[1] + self.max[1]) * 0.5,
            (self.min[2] + self.max[2]) * 0.5,
        ]
    }

    /// World-space box of this box under an affine transform.
    pub fn transformed(&self, m: &Affine3A) -> Aabb {
        if self.is_degenerate() {
            return Aabb::EMPTY;
        }
        let mut out = Aabb::EMPTY;
        for corner in 0..8 {
            let p = Vec3::new(
                if corner & 1 == 0 { self.min[0] } else { self.max[0] },
                if corner & 2 == 0 { self.min[1] } else { self.max[1] },
                if corner & 4 == 0 { self.min[2] } else { self.max[2] },
            );
            out.grow_point(m.transform_point3(p).to_array());
        }
        out
    }

    /// Slab test. Returns the entry distance if the ray overlaps `[t_min, t_max]`.
    #[inline]
    pub fn intersect(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<f32> {
        let mut t0 = t_min;
        let mut t1 = t_max;
        for axis in 0..3 {
            let inv = 1.0 / ray.direction[axis];
            let mut near = (self.min[axis] - ray.origin[axis]) * inv;
            let mut far = (self.max[axis] - ray.origin[axis]) * inv;
            if near > far {
                std::mem::swap(&mut near, &mut far);
            }
            // NaN from 0 * inf leaves the bound untouched
            if near > t0 {
                t0 = near;
            }
            if far < t1 {
                t1 = far;
            }
            if t0 > t1 {
                return None;
            }
        }
        Some(t0)
    }
}

/// Ray with origin and (not necessarily normalized) direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Same ray expressed in another space.
    #[inline]
    pub fn transformed(&self, m: &Affine3A) -> Ray {
        Ray {
            origin: m.transform_point3(self.origin),
            direction: m.transform_vector3(self.direction),
        }
    }
}

/// Texel extent of a 1D/2D/3D image or region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3 {
    #[inline]
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    #[inline]
    pub const fn d2(width: u32, height: u32) -> Self {
        Self { width, height, depth: 1 }
    }

    #[inline]
    pub fn to_array(self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    #[inline]
    pub fn from_array(a: [u32; 3]) -> Self {
        Self { width: a[0], height: a[1], depth: a[2] }
    }

    /// Total texel count.
    #[inline]
    pub fn texel_count(self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    /// Linear index of texel `(x, y, z)`, x fastest.
    #[inline]
    pub fn linear(self, x: u32, y: u32, z: u32) -> usize {
        (z as usize * self.height as usize + y as usize) * self.width as usize + x as usize
    }
}

/// Greatest common divisor.
#[inline]
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Round `value` up to a multiple of `alignment` (power of two not required).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Number of workgroups covering `extent` with groups of `dim`.
#[inline]
pub fn dispatch_size(extent: [u32; 3], dim: [u32; 3]) -> [u32; 3] {
    [
        extent[0].div_ceil(dim[0].max(1)),
        extent[1].div_ceil(dim[1].max(1)),
        extent[2].div_ceil(dim[2].max(1)),
    ]
}

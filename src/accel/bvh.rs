//! Binned-SAH BVH over primitive bounds.
//!
//! Produces the flat 32-byte node array stored inside every acceleration
//! structure. Node 0 is the root, children of an internal node are adjacent.

use bytemuck::{Pod, Zeroable};

use crate::config::BvhConfig;
use crate::util::Aabb;

use super::types::BuildFlags;

const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;
const MAX_BINS: usize = 64;

/// Flat BVH node (32 bytes).
///
/// Internal node: `left_or_first` = left child index, `count` = 0.
/// Leaf node: `left_or_first` = first slot in the primitive order, `count` > 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.aabb_min, self.aabb_max)
    }

    fn leaf(bounds: &Aabb, first: usize, count: usize) -> Self {
        Self { aabb_min: bounds.min, left_or_first: first as u32, aabb_max: bounds.max, count: count as u32 }
    }
}

/// SAH parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvhOptions {
    pub bins: usize,
    pub max_leaf_size: usize,
}

impl BvhOptions {
    /// Pick parameters from the build preference flags.
    pub fn from_flags(flags: BuildFlags, config: &BvhConfig) -> Self {
        let (bins, leaf) = if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
            (config.fast_build_bins, config.fast_build_leaf_size)
        } else {
            (config.fast_trace_bins, config.fast_trace_leaf_size)
        };
        Self { bins: (bins as usize).clamp(2, MAX_BINS), max_leaf_size: (leaf as usize).max(1) }
    }
}

impl Default for BvhOptions {
    fn default() -> Self {
        Self::from_flags(BuildFlags::PREFER_FAST_TRACE, &BvhConfig::default())
    }
}

/// Built hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    /// Leaves reference into this; values index the input slice.
    pub order: Vec<u32>,
}

impl Bvh {
    /// Upper bound on node count for `n` primitives.
    #[inline]
    pub fn max_nodes(n: usize) -> usize {
        (2 * n).saturating_sub(1).max(1)
    }
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

/// Build over `bounds`. Every entry is assumed active.
#[tracing::instrument(skip_all, fields(prims = bounds.len(), bins = options.bins))]
pub fn build(bounds: &[Aabb], options: BvhOptions) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh { nodes: vec![BvhNode::zeroed()], order: Vec::new() };
    }

    let centroids: Vec<[f32; 3]> = bounds.iter().map(|b| b.centroid()).collect();
    let mut order: Vec<u32> = (0..n as u32).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(Bvh::max_nodes(n));
    nodes.push(BvhNode::zeroed());

    let mut stack = vec![(0usize, 0usize, n)];
    while let Some((node, start, end)) = stack.pop() {
        let count = end - start;
        let mut node_bounds = Aabb::EMPTY;
        let mut centroid_bounds = Aabb::EMPTY;
        for &i in &order[start..end] {
            node_bounds.grow(&bounds[i as usize]);
            centroid_bounds.grow_point(centroids[i as usize]);
        }

        if count <= options.max_leaf_size {
            nodes[node] = BvhNode::leaf(&node_bounds, start, count);
            continue;
        }

        let split = find_split(&order[start..end], bounds, &centroids, &centroid_bounds, options.bins);
        let leaf_cost = count as f32 * INTERSECT_COST * node_bounds.area();
        let mid = match split {
            Some((axis, pos, cost)) if cost < leaf_cost || count > options.max_leaf_size * 8 => {
                let m = partition(&mut order[start..end], |&i| centroids[i as usize][axis] < pos) + start;
                if m == start || m == end {
                    (start + end) / 2
                } else {
                    m
                }
            }
            // coincident centroids: split by order so leaves stay bounded
            None => (start + end) / 2,
            Some(_) => {
                nodes[node] = BvhNode::leaf(&node_bounds, start, count);
                continue;
            }
        };

        let left = nodes.len();
        nodes.push(BvhNode::zeroed());
        nodes.push(BvhNode::zeroed());
        nodes[node] = BvhNode {
            aabb_min: node_bounds.min,
            left_or_first: left as u32,
            aabb_max: node_bounds.max,
            count: 0,
        };
        stack.push((left + 1, mid, end));
        stack.push((left, start, mid));
    }

    Bvh { nodes, order }
}

fn find_split(
    order: &[u32],
    bounds: &[Aabb],
    centroids: &[[f32; 3]],
    centroid_bounds: &Aabb,
    bin_count: usize,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;
    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue;
        }
        let mut bins = [Bin { bounds: Aabb::EMPTY, count: 0 }; MAX_BINS];
        let bins = &mut bins[..bin_count];
        let scale = bin_count as f32 / extent;
        for &i in order {
            let b = ((centroids[i as usize][axis] - centroid_bounds.min[axis]) * scale) as usize;
            let bin = &mut bins[b.min(bin_count - 1)];
            bin.bounds.grow(&bounds[i as usize]);
            bin.count += 1;
        }

        let mut left_area = [0.0f32; MAX_BINS];
        let mut left_count = [0usize; MAX_BINS];
        let mut sweep = Aabb::EMPTY;
        let mut acc = 0;
        for i in 0..bin_count - 1 {
            sweep.grow(&bins[i].bounds);
            acc += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = acc;
        }

        sweep = Aabb::EMPTY;
        acc = 0;
        for i in (1..bin_count).rev() {
            sweep.grow(&bins[i].bounds);
            acc += bins[i].count;
            if left_count[i - 1] == 0 || acc == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST * (left_count[i - 1] as f32 * left_area[i - 1] + acc as f32 * sweep.area());
            if best.is_none_or(|(_, _, c)| cost < c) {
                let pos = centroid_bounds.min[axis] + (i as f32 / bin_count as f32) * extent;
                best = Some((axis, pos, cost));
            }
        }
    }
    best
}

/// In-place partition, returns the count of elements matching `pred`.
fn partition<T, F: Fn(&T) -> bool>(slice: &mut [T], pred: F) -> usize {
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32) -> Aabb {
        Aabb::new([x - 0.5, -0.5, -0.5], [x + 0.5, 0.5, 0.5])
    }

    fn check_invariants(bvh: &Bvh, n: usize) {
        assert!(bvh.nodes.len() <= Bvh::max_nodes(n));
        let mut sorted = bvh.order.clone();
        sorted.sort();
        assert_eq!(sorted, (0..n as u32).collect::<Vec<_>>());
        let leaf_total: u32 = bvh.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count).sum();
        assert_eq!(leaf_total as usize, n);
    }

    #[test]
    fn test_empty() {
        let bvh = build(&[], BvhOptions::default());
        assert_eq!(bvh.nodes.len(), 1);
        assert!(!bvh.nodes[0].is_leaf());
        assert!(bvh.order.is_empty());
    }

    #[test]
    fn test_single_leaf() {
        let bvh = build(&[unit_box(0.0)], BvhOptions::default());
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 1);
    }

    #[test]
    fn test_spread_boxes_split() {
        let boxes: Vec<Aabb> = (0..100).map(|i| unit_box(i as f32 * 2.0)).collect();
        let bvh = build(&boxes, BvhOptions::default());
        assert!(bvh.nodes.len() > 1);
        check_invariants(&bvh, 100);
        assert!(bvh.nodes[0].aabb_min[0] <= -0.5);
        assert!(bvh.nodes[0].aabb_max[0] >= 198.5);
    }

    #[test]
    fn test_coincident_boxes_stay_bounded() {
        let boxes = vec![unit_box(1.0); 64];
        let options = BvhOptions { bins: 8, max_leaf_size: 4 };
        let bvh = build(&boxes, options);
        check_invariants(&bvh, 64);
        assert!(bvh.nodes.iter().all(|n| n.count as usize <= 4));
    }

    #[test]
    fn test_flags_pick_parameters() {
        let config = BvhConfig::default();
        let trace = BvhOptions::from_flags(BuildFlags::PREFER_FAST_TRACE, &config);
        let fast = BvhOptions::from_flags(BuildFlags::PREFER_FAST_BUILD, &config);
        assert!(trace.bins > fast.bins);
        assert_eq!(trace.bins, config.fast_trace_bins as usize);
    }
}

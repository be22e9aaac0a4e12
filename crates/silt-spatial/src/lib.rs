//! Spatial acceleration structures for particle simulation.
//!
//! Provides the two query structures the simulation core leans on:
//! - [`Bvh`] - bounding volume hierarchy for swept (padded) segment casts
//!   against triangle soups and for sphere overlap queries
//! - [`KdTree3`] - balanced 3-D k-d tree for nearest-neighbor and
//!   fixed-radius range queries over particle positions
//!
//! Both are rebuilt per frame when stale; consumers stamp them with the
//! frame they were built for.

use glam::Vec3;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Axis-aligned bounding box
// ============================================================================

/// An axis-aligned bounding box in 3D space.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Aabb3 {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl Aabb3 {
    /// Creates a box from min/max corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing all `points`. Empty input gives a zero box.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut iter = points.into_iter();
        let Some(first) = iter.next() else {
            return Self::new(Vec3::ZERO, Vec3::ZERO);
        };
        let mut bb = Self::new(first, first);
        for p in iter {
            bb.min = bb.min.min(p);
            bb.max = bb.max.max(p);
        }
        bb
    }

    /// Returns the center point.
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Returns the size along each axis.
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Returns the union of this box and another.
    pub fn union(&self, other: &Aabb3) -> Aabb3 {
        Aabb3 {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Grows the box by `r` on all sides.
    pub fn inflated(&self, r: f32) -> Aabb3 {
        Aabb3 {
            min: self.min - Vec3::splat(r),
            max: self.max + Vec3::splat(r),
        }
    }

    /// Checks if this box intersects another.
    pub fn intersects(&self, other: &Aabb3) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Checks if the box overlaps a sphere.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        let closest = center.clamp(self.min, self.max);
        closest.distance_squared(center) <= radius * radius
    }
}

// ============================================================================
// Ray
// ============================================================================

/// A ray with an origin and a direction.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ray {
    /// Ray origin.
    pub origin: Vec3,
    /// Ray direction, normalized.
    pub direction: Vec3,
}

impl Ray {
    /// Creates a new ray; the direction is normalized.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or(Vec3::Z),
        }
    }

    /// Returns the point at parameter `t` along the ray.
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Slab test against a box. Returns entry/exit parameters, where a
    /// negative entry means the origin is inside.
    pub fn intersect_aabb(&self, aabb: &Aabb3) -> Option<(f32, f32)> {
        let mut t_min = f32::NEG_INFINITY;
        let mut t_max = f32::INFINITY;

        for axis in 0..3 {
            let origin = self.origin[axis];
            let dir = self.direction[axis];
            let min = aabb.min[axis];
            let max = aabb.max[axis];

            if dir.abs() < 1.0e-12 {
                if origin < min || origin > max {
                    return None;
                }
            } else {
                let inv = 1.0 / dir;
                let (t0, t1) = if inv >= 0.0 {
                    ((min - origin) * inv, (max - origin) * inv)
                } else {
                    ((max - origin) * inv, (min - origin) * inv)
                };
                t_min = t_min.max(t0);
                t_max = t_max.min(t1);
                if t_min > t_max {
                    return None;
                }
            }
        }

        Some((t_min, t_max))
    }
}

// ============================================================================
// Bounding volume hierarchy
// ============================================================================

#[derive(Debug)]
enum BvhNode {
    Leaf {
        bounds: Aabb3,
        /// Index range into the reordered primitive array.
        start: u32,
        count: u32,
    },
    Internal {
        bounds: Aabb3,
        left: Box<BvhNode>,
        right: Box<BvhNode>,
    },
}

impl BvhNode {
    fn bounds(&self) -> &Aabb3 {
        match self {
            BvhNode::Leaf { bounds, .. } => bounds,
            BvhNode::Internal { bounds, .. } => bounds,
        }
    }
}

/// A bounding volume hierarchy over boxed primitives.
///
/// Built once per frame from primitive bounds; queries report the stored
/// payloads whose bounds pass the broad-phase test. Narrow-phase checks
/// (exact triangle distances, time-of-impact roots) are the caller's job.
#[derive(Debug)]
pub struct Bvh<T> {
    prims: Vec<(Aabb3, T)>,
    root: Option<BvhNode>,
}

const BVH_LEAF_SIZE: usize = 4;

impl<T> Bvh<T> {
    /// Builds a BVH from (bounds, payload) pairs, median-splitting along
    /// the longest axis.
    pub fn build(mut prims: Vec<(Aabb3, T)>) -> Self {
        if prims.is_empty() {
            return Self {
                prims,
                root: None,
            };
        }
        let n = prims.len();
        let root = Self::build_range(&mut prims, 0, n);
        Self {
            prims,
            root: Some(root),
        }
    }

    fn build_range(prims: &mut [(Aabb3, T)], start: usize, end: usize) -> BvhNode {
        let slice = &prims[start..end];
        let bounds = slice
            .iter()
            .fold(slice[0].0, |acc, (b, _)| acc.union(b));

        if end - start <= BVH_LEAF_SIZE {
            return BvhNode::Leaf {
                bounds,
                start: start as u32,
                count: (end - start) as u32,
            };
        }

        let size = bounds.size();
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };

        let mid = (start + end) / 2;
        prims[start..end].select_nth_unstable_by(mid - start, |(a, _), (b, _)| {
            a.center()[axis].total_cmp(&b.center()[axis])
        });

        let left = Box::new(Self::build_range(prims, start, mid));
        let right = Box::new(Self::build_range(prims, mid, end));

        BvhNode::Internal {
            bounds,
            left,
            right,
        }
    }

    /// Number of primitives in the tree.
    pub fn len(&self) -> usize {
        self.prims.len()
    }

    /// Whether the tree holds no primitives.
    pub fn is_empty(&self) -> bool {
        self.prims.is_empty()
    }

    /// Casts a segment of `length` along `ray`, padded by `radius`, and
    /// visits every primitive whose inflated bounds it touches.
    ///
    /// Used for continuous collision detection: the padding accounts for
    /// the particle's collision radius plus any per-substep primitive
    /// motion folded into the primitive bounds at build time.
    pub fn cast_segment<'a>(
        &'a self,
        ray: &Ray,
        length: f32,
        radius: f32,
        mut visit: impl FnMut(&'a T),
    ) {
        let Some(root) = &self.root else { return };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let bounds = node.bounds().inflated(radius);
            match ray.intersect_aabb(&bounds) {
                Some((t_min, t_max)) if t_max >= 0.0 && t_min <= length => {}
                _ => continue,
            }
            match node {
                BvhNode::Leaf { start, count, .. } => {
                    for (_, data) in
                        &self.prims[*start as usize..(*start + *count) as usize]
                    {
                        visit(data);
                    }
                }
                BvhNode::Internal { left, right, .. } => {
                    stack.push(left.as_ref());
                    stack.push(right.as_ref());
                }
            }
        }
    }

    /// Visits every primitive whose bounds overlap the sphere.
    pub fn query_sphere<'a>(
        &'a self,
        center: Vec3,
        radius: f32,
        mut visit: impl FnMut(&'a T),
    ) {
        let Some(root) = &self.root else { return };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !node.bounds().intersects_sphere(center, radius) {
                continue;
            }
            match node {
                BvhNode::Leaf { start, count, .. } => {
                    for (bounds, data) in
                        &self.prims[*start as usize..(*start + *count) as usize]
                    {
                        if bounds.intersects_sphere(center, radius) {
                            visit(data);
                        }
                    }
                }
                BvhNode::Internal { left, right, .. } => {
                    stack.push(left.as_ref());
                    stack.push(right.as_ref());
                }
            }
        }
    }
}

// ============================================================================
// K-d tree
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct KdNode {
    co: Vec3,
    index: u32,
    left: i32,
    right: i32,
}

/// A balanced 3-D k-d tree over points with payload indices.
///
/// Insert all points, then [`balance`](KdTree3::balance) once before
/// querying; queries on an unbalanced tree return nothing.
#[derive(Debug, Default)]
pub struct KdTree3 {
    nodes: Vec<KdNode>,
    root: i32,
    balanced: bool,
}

impl KdTree3 {
    /// Creates an empty tree with capacity for `n` points.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(n),
            root: -1,
            balanced: false,
        }
    }

    /// Adds a point. Invalidates any earlier balance.
    pub fn insert(&mut self, index: u32, co: Vec3) {
        self.nodes.push(KdNode {
            co,
            index,
            left: -1,
            right: -1,
        });
        self.balanced = false;
    }

    /// Number of points in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds no points.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Builds the balanced tree by recursive median splits.
    pub fn balance(&mut self) {
        let n = self.nodes.len();
        if n == 0 {
            self.root = -1;
            self.balanced = true;
            return;
        }
        let mut order: Vec<u32> = (0..n as u32).collect();
        self.root = self.balance_range(&mut order, 0, n, 0);
        self.balanced = true;
    }

    fn balance_range(&mut self, order: &mut [u32], start: usize, end: usize, depth: usize) -> i32 {
        if start >= end {
            return -1;
        }
        let axis = depth % 3;
        let mid = (start + end) / 2;
        let nodes = &self.nodes;
        order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            nodes[a as usize].co[axis].total_cmp(&nodes[b as usize].co[axis])
        });

        let node = order[mid] as i32;
        let left = self.balance_range(order, start, mid, depth + 1);
        let right = self.balance_range(order, mid + 1, end, depth + 1);
        self.nodes[node as usize].left = left;
        self.nodes[node as usize].right = right;
        node
    }

    /// Finds the payload index and squared distance of the point nearest
    /// to `co`.
    pub fn nearest(&self, co: Vec3) -> Option<(u32, f32)> {
        if !self.balanced || self.root < 0 {
            return None;
        }
        let mut best: Option<(u32, f32)> = None;
        self.nearest_recursive(self.root, co, 0, &mut best);
        best
    }

    fn nearest_recursive(&self, node: i32, co: Vec3, depth: usize, best: &mut Option<(u32, f32)>) {
        if node < 0 {
            return;
        }
        let n = &self.nodes[node as usize];
        let d2 = n.co.distance_squared(co);
        if best.map_or(true, |(_, bd2)| d2 < bd2) {
            *best = Some((n.index, d2));
        }

        let axis = depth % 3;
        let delta = co[axis] - n.co[axis];
        let (near, far) = if delta < 0.0 {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };

        self.nearest_recursive(near, co, depth + 1, best);
        if best.map_or(true, |(_, bd2)| delta * delta < bd2) {
            self.nearest_recursive(far, co, depth + 1, best);
        }
    }

    /// Visits every point within `radius` of `co` with its squared
    /// distance. Order is unspecified.
    pub fn range(&self, co: Vec3, radius: f32, mut visit: impl FnMut(u32, f32)) {
        if !self.balanced || self.root < 0 {
            return;
        }
        let r2 = radius * radius;
        let mut stack = vec![(self.root, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            if node < 0 {
                continue;
            }
            let n = &self.nodes[node as usize];
            let d2 = n.co.distance_squared(co);
            if d2 <= r2 {
                visit(n.index, d2);
            }

            let axis = depth % 3;
            let delta = co[axis] - n.co[axis];
            let (near, far) = if delta < 0.0 {
                (n.left, n.right)
            } else {
                (n.right, n.left)
            };
            stack.push((near, depth + 1));
            if delta * delta <= r2 {
                stack.push((far, depth + 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_from_points() {
        let bb = Aabb3::from_points([
            Vec3::new(1.0, -2.0, 3.0),
            Vec3::new(-1.0, 2.0, 0.0),
            Vec3::new(0.5, 0.0, 5.0),
        ]);
        assert_eq!(bb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(bb.max, Vec3::new(1.0, 2.0, 5.0));
    }

    #[test]
    fn test_aabb_sphere_overlap() {
        let bb = Aabb3::new(Vec3::ZERO, Vec3::ONE);
        assert!(bb.intersects_sphere(Vec3::new(1.5, 0.5, 0.5), 0.6));
        assert!(!bb.intersects_sphere(Vec3::new(2.0, 0.5, 0.5), 0.5));
    }

    #[test]
    fn test_ray_aabb_hit() {
        let bb = Aabb3::new(Vec3::ZERO, Vec3::ONE);
        let ray = Ray::new(Vec3::new(0.5, 0.5, -2.0), Vec3::Z);
        let (t0, t1) = ray.intersect_aabb(&bb).unwrap();
        assert!((t0 - 2.0).abs() < 1.0e-5);
        assert!((t1 - 3.0).abs() < 1.0e-5);
    }

    #[test]
    fn test_ray_aabb_miss() {
        let bb = Aabb3::new(Vec3::ZERO, Vec3::ONE);
        let ray = Ray::new(Vec3::new(2.0, 2.0, -2.0), Vec3::Z);
        assert!(ray.intersect_aabb(&bb).is_none());
    }

    fn grid_bvh() -> Bvh<usize> {
        let mut prims = Vec::new();
        for i in 0..10 {
            let min = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
            prims.push((Aabb3::new(min, min + Vec3::ONE), i));
        }
        Bvh::build(prims)
    }

    #[test]
    fn test_bvh_segment_cast() {
        let bvh = grid_bvh();
        let ray = Ray::new(Vec3::new(0.5, 0.5, -5.0), Vec3::Z);
        let mut hits = Vec::new();
        bvh.cast_segment(&ray, 10.0, 0.0, |&i| hits.push(i));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn test_bvh_segment_cast_radius_padding() {
        let bvh = grid_bvh();
        // Passes 0.4 to the side of box 1; only reached with padding.
        let ray = Ray::new(Vec3::new(2.5, 1.4, -5.0), Vec3::Z);
        let mut hits = Vec::new();
        bvh.cast_segment(&ray, 10.0, 0.0, |&i| hits.push(i));
        assert!(hits.is_empty());
        bvh.cast_segment(&ray, 10.0, 0.5, |&i| hits.push(i));
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn test_bvh_segment_length_limit() {
        let bvh = grid_bvh();
        let ray = Ray::new(Vec3::new(-2.0, 0.5, 0.5), Vec3::X);
        let mut hits = Vec::new();
        bvh.cast_segment(&ray, 3.0, 0.0, |&i| hits.push(i));
        assert_eq!(hits, vec![0]);
    }

    #[test]
    fn test_bvh_query_sphere() {
        let bvh = grid_bvh();
        let mut hits = Vec::new();
        bvh.query_sphere(Vec3::new(2.5, 0.5, 0.5), 2.0, |&i| hits.push(i));
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);
    }

    #[test]
    fn test_kdtree_nearest() {
        let mut tree = KdTree3::with_capacity(100);
        for i in 0..100u32 {
            let f = i as f32;
            tree.insert(i, Vec3::new(f % 10.0, f / 10.0, 0.0));
        }
        tree.balance();

        let (index, d2) = tree.nearest(Vec3::new(3.1, 4.9, 0.0)).unwrap();
        assert_eq!(index, 53);
        assert!(d2 < 0.05);
    }

    #[test]
    fn test_kdtree_range() {
        let mut tree = KdTree3::with_capacity(10);
        for i in 0..10u32 {
            tree.insert(i, Vec3::new(i as f32, 0.0, 0.0));
        }
        tree.balance();

        let mut found = Vec::new();
        tree.range(Vec3::new(4.0, 0.0, 0.0), 1.5, |i, _| found.push(i));
        found.sort_unstable();
        assert_eq!(found, vec![3, 4, 5]);
    }

    #[test]
    fn test_kdtree_unbalanced_returns_nothing() {
        let mut tree = KdTree3::with_capacity(4);
        tree.insert(0, Vec3::ZERO);
        assert!(tree.nearest(Vec3::ZERO).is_none());
        tree.balance();
        assert!(tree.nearest(Vec3::ZERO).is_some());
    }
}

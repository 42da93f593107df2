//! Slot region geometry.
//!
//! Polygons are expressed in the working pixel space of a stream. Containment is
//! inclusive: a point on an edge or vertex is inside. This matters at slot borders,
//! where a vehicle centre sitting exactly on a painted line must still count.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Minimum vertex count for a slot polygon.
pub const MIN_POLYGON_POINTS: usize = 3;

const EDGE_EPSILON: f32 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

/// Closed polygon with at least three vertices. May be non-convex.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Polygon {
    vertices: Vec<Point>,
}

impl Polygon {
    /// Build a polygon. Fewer than three vertices, or non-finite coordinates, are rejected.
    pub fn new(vertices: Vec<Point>) -> Result<Self> {
        if vertices.len() < MIN_POLYGON_POINTS {
            return Err(anyhow!(
                "polygon needs at least {} points, got {}",
                MIN_POLYGON_POINTS,
                vertices.len()
            ));
        }
        if vertices.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(anyhow!("polygon has non-finite coordinates"));
        }
        Ok(Self { vertices })
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    /// True iff `point` lies inside the polygon or on its boundary.
    pub fn contains(&self, point: Point) -> bool {
        contains(&self.vertices, point)
    }
}

/// Ray-casting containment test, inclusive of the boundary.
///
/// Callers are expected to pass a validated vertex list (see [`Polygon::new`]);
/// a degenerate list simply never contains anything but its own edges.
pub fn contains(vertices: &[Point], point: Point) -> bool {
    let n = vertices.len();
    if n == 0 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = vertices[i];
        let b = vertices[j];

        if on_segment(a, b, point) {
            return true;
        }

        // Half-open rule on y avoids double counting shared vertices.
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let scale = (b.x - a.x).abs().max((b.y - a.y).abs()).max(1.0);
    if cross.abs() > EDGE_EPSILON * scale {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly(points: &[(f32, f32)]) -> Polygon {
        Polygon::new(points.iter().copied().map(Point::from).collect()).unwrap()
    }

    #[test]
    fn square_contains_interior_not_exterior() {
        let square = poly(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        assert!(square.contains(Point::new(5.0, 5.0)));
        assert!(!square.contains(Point::new(15.0, 5.0)));
        assert!(!square.contains(Point::new(-0.5, 5.0)));
        assert!(!square.contains(Point::new(5.0, 10.5)));
    }

    #[test]
    fn boundary_points_are_inside() {
        let square = poly(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        assert!(square.contains(Point::new(10.0, 5.0)));
        assert!(square.contains(Point::new(5.0, 0.0)));
        assert!(square.contains(Point::new(0.0, 0.0)));
        assert!(square.contains(Point::new(10.0, 10.0)));

        let tilted = poly(&[(0.0, 0.0), (10.0, 10.0), (0.0, 20.0)]);
        assert!(tilted.contains(Point::new(5.0, 5.0)));
        assert!(tilted.contains(Point::new(5.0, 15.0)));
    }

    #[test]
    fn non_convex_polygon_excludes_notch() {
        // U shape opening upwards: notch between x=4..6 above y=4.
        let u = poly(&[
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (6.0, 10.0),
            (6.0, 4.0),
            (4.0, 4.0),
            (4.0, 10.0),
            (0.0, 10.0),
        ]);
        assert!(u.contains(Point::new(2.0, 8.0)));
        assert!(u.contains(Point::new(8.0, 8.0)));
        assert!(u.contains(Point::new(5.0, 2.0)));
        assert!(!u.contains(Point::new(5.0, 8.0)));
    }

    #[test]
    fn degenerate_polygons_are_rejected_at_construction() {
        assert!(Polygon::new(vec![]).is_err());
        assert!(Polygon::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]).is_err());
        assert!(Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(f32::NAN, 1.0),
            Point::new(1.0, 0.0)
        ])
        .is_err());
    }
}

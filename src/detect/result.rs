use crate::geometry::Point;

/// One object found in one sampled frame.
///
/// Coordinates are axis-aligned box corners in the stream's working pixel space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence,
            class_id,
        }
    }

    /// Reference point used for slot assignment: the box centre.
    pub fn center(&self) -> Point {
        Point::new((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }
}

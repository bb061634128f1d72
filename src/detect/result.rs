use serde::Serialize;

/// Box in model-input coordinates, each edge normalised to `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct NormalizedBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl NormalizedBox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn area(&self) -> f32 {
        (self.xmax - self.xmin).max(0.0) * (self.ymax - self.ymin).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &NormalizedBox) -> f32 {
        let ix = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
        let iy = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Scale to pixel coordinates of a `width` x `height` frame.
    ///
    /// Edges are clamped to the frame; `w`/`h` are the difference of the
    /// truncated edges, as the annotation stage draws them.
    pub fn to_pixels(&self, width: u32, height: u32) -> BoundingBox {
        let scale = |v: f32, extent: u32| (v.clamp(0.0, 1.0) * extent as f32) as i32;
        let x = scale(self.xmin, width);
        let y = scale(self.ymin, height);
        let x2 = scale(self.xmax, width);
        let y2 = scale(self.ymax, height);
        BoundingBox {
            x,
            y,
            w: (x2 - x).max(0),
            h: (y2 - y).max(0),
        }
    }
}

/// Raw backend output for one object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub class_id: u32,
    pub label: String,
    pub score: f32,
    pub bbox: NormalizedBox,
}

/// Pixel-space box in the source frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Thresholded prediction scaled to the source frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn from_prediction(prediction: Prediction, width: u32, height: u32) -> Self {
        Self {
            bbox: prediction.bbox.to_pixels(width, height),
            class_id: prediction.class_id,
            label: prediction.label,
            score: prediction.score,
        }
    }

    /// Caption drawn above the box.
    pub fn caption(&self) -> String {
        format!("{}: {:.2}", self.label, self.score)
    }
}

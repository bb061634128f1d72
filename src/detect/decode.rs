//! Output-tensor decoding for the supported detector families.
//!
//! Kept free of any inference runtime so the math is testable without model
//! files.

use anyhow::{anyhow, Result};

use crate::detect::labels::LabelMap;
use crate::detect::result::{NormalizedBox, Prediction};

/// Decode SSD-style outputs.
///
/// `boxes` holds `count` quadruples of `(ymin, xmin, ymax, xmax)` already
/// normalised to `[0, 1]`; `classes` and `scores` hold one value per box.
/// `num_detections` caps how many leading entries are valid.
pub fn decode_ssd(
    boxes: &[f32],
    classes: &[f32],
    scores: &[f32],
    num_detections: usize,
    labels: &LabelMap,
) -> Result<Vec<Prediction>> {
    let available = (boxes.len() / 4).min(classes.len()).min(scores.len());
    if num_detections > available {
        return Err(anyhow!(
            "ssd output reports {} detections but only {} are present",
            num_detections,
            available
        ));
    }

    let predictions = (0..num_detections)
        .map(|i| {
            let b = &boxes[i * 4..i * 4 + 4];
            let class_id = classes[i].max(0.0) as u32;
            Prediction {
                class_id,
                label: labels.label(class_id).to_string(),
                score: scores[i],
                bbox: NormalizedBox::new(b[1], b[0], b[3], b[2]),
            }
        })
        .collect();
    Ok(predictions)
}

/// Shape of a YOLO detection head output `[1, 4 + classes, anchors]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct YoloHead {
    pub num_classes: usize,
    pub anchors: usize,
}

impl YoloHead {
    /// Infer the head layout from an output shape.
    pub fn from_shape(shape: &[usize]) -> Result<Self> {
        match shape {
            [1, rows, anchors] if *rows > 4 => Ok(Self {
                num_classes: rows - 4,
                anchors: *anchors,
            }),
            other => Err(anyhow!("unexpected yolo output shape {:?}", other)),
        }
    }
}

/// Decode a YOLO head into predictions above `min_score`.
///
/// Each anchor column holds `(cx, cy, w, h)` in input pixels followed by one
/// score per class. Boxes are normalised by the model input size.
pub fn decode_yolo(
    output: &[f32],
    head: YoloHead,
    input_width: u32,
    input_height: u32,
    min_score: f32,
    labels: &LabelMap,
) -> Result<Vec<Prediction>> {
    let rows = head.num_classes + 4;
    if output.len() != rows * head.anchors {
        return Err(anyhow!(
            "yolo output has {} values, expected {}",
            output.len(),
            rows * head.anchors
        ));
    }
    let at = |row: usize, col: usize| output[row * head.anchors + col];
    let (iw, ih) = (input_width as f32, input_height as f32);

    let mut predictions = Vec::new();
    for col in 0..head.anchors {
        let Some((class_id, score)) = (0..head.num_classes)
            .map(|c| (c, at(4 + c, col)))
            .reduce(|best, x| if x.1 > best.1 { x } else { best })
        else {
            continue;
        };
        if score < min_score {
            continue;
        }

        let (cx, cy, w, h) = (at(0, col), at(1, col), at(2, col), at(3, col));
        let class_id = class_id as u32;
        predictions.push(Prediction {
            class_id,
            label: labels.label(class_id).to_string(),
            score,
            bbox: NormalizedBox::new(
                (cx - w / 2.0) / iw,
                (cy - h / 2.0) / ih,
                (cx + w / 2.0) / iw,
                (cy + h / 2.0) / ih,
            ),
        });
    }
    Ok(predictions)
}

/// Greedy class-agnostic non-maximum suppression, highest score first.
pub fn non_max_suppression(predictions: &mut Vec<Prediction>, iou_threshold: f32) {
    predictions.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept = 0;
    for index in 0..predictions.len() {
        let overlaps = (0..kept)
            .any(|prev| predictions[prev].bbox.iou(&predictions[index].bbox) > iou_threshold);
        if !overlaps {
            predictions.swap(kept, index);
            kept += 1;
        }
    }
    predictions.truncate(kept);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelMap {
        LabelMap::parse("person\nbicycle\ncar")
    }

    #[test]
    fn ssd_boxes_are_reordered_to_x_first() -> Result<()> {
        let boxes = [0.1, 0.2, 0.5, 0.6, 0.0, 0.0, 1.0, 1.0];
        let classes = [2.0, 7.0];
        let scores = [0.9, 0.4];

        let predictions = decode_ssd(&boxes, &classes, &scores, 2, &labels())?;
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].label, "car");
        assert_eq!(predictions[0].bbox, NormalizedBox::new(0.2, 0.1, 0.6, 0.5));
        assert_eq!(predictions[1].label, "Unknown");
        Ok(())
    }

    #[test]
    fn ssd_rejects_inconsistent_counts() {
        assert!(decode_ssd(&[0.0; 4], &[0.0], &[0.5], 3, &labels()).is_err());
    }

    #[test]
    fn yolo_head_layout_is_inferred() -> Result<()> {
        let head = YoloHead::from_shape(&[1, 84, 8400])?;
        assert_eq!(head.num_classes, 80);
        assert_eq!(head.anchors, 8400);
        assert!(YoloHead::from_shape(&[1, 3, 10]).is_err());
        Ok(())
    }

    #[test]
    fn yolo_columns_decode_to_normalised_boxes() -> Result<()> {
        // Two anchors, three classes; rows are cx, cy, w, h, p0, p1, p2.
        #[rustfmt::skip]
        let output = [
            320.0, 10.0,
            320.0, 10.0,
            64.0,  4.0,
            128.0, 4.0,
            0.1,   0.05,
            0.8,   0.05,
            0.3,   0.1,
        ];
        let head = YoloHead {
            num_classes: 3,
            anchors: 2,
        };

        let predictions = decode_yolo(&output, head, 640, 640, 0.25, &labels())?;
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.class_id, 1);
        assert_eq!(p.label, "bicycle");
        assert!((p.bbox.xmin - 0.45).abs() < 1e-6);
        assert!((p.bbox.ymax - 0.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn nms_keeps_the_strongest_of_overlapping_boxes() {
        let make = |score: f32, bbox: NormalizedBox| Prediction {
            class_id: 0,
            label: "person".to_string(),
            score,
            bbox,
        };
        let mut predictions = vec![
            make(0.6, NormalizedBox::new(0.0, 0.0, 0.5, 0.5)),
            make(0.9, NormalizedBox::new(0.01, 0.01, 0.5, 0.5)),
            make(0.7, NormalizedBox::new(0.6, 0.6, 0.9, 0.9)),
        ];

        non_max_suppression(&mut predictions, 0.45);
        let scores: Vec<f32> = predictions.iter().map(|p| p.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }
}

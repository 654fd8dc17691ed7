use crate::config::DetectionConfig;
use crate::error::{CaptureError, SessionError};
use crate::frame::Frame;
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contours::{find_contours, Contour};
use imageproc::contrast::threshold;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::map::map_colors2;
use imageproc::morphology::dilate;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Blur applied before differencing, wide enough to suppress sensor noise
const BLUR_SIGMA: f32 = 3.5;

/// Running average the current scene is compared against
type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Named sensitivity tiers exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityPreset {
    Less,
    Default,
    More,
}

impl SensitivityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityPreset::Less => "less",
            SensitivityPreset::Default => "default",
            SensitivityPreset::More => "more",
        }
    }
}

impl FromStr for SensitivityPreset {
    type Err = SessionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "less" => Ok(SensitivityPreset::Less),
            "default" => Ok(SensitivityPreset::Default),
            "more" => Ok(SensitivityPreset::More),
            other => Err(SessionError::InvalidPreset {
                preset: other.to_string(),
            }),
        }
    }
}

/// Accepted size range for a motion region's bounding box.
///
/// The height bounds always mirror the width bounds when a preset is
/// applied; a detection is accepted only when both axes fall inside
/// their range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensitivity {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

impl Sensitivity {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            min_width: config.min_width,
            max_width: config.max_width,
            min_height: config.min_height,
            max_height: config.max_height,
        }
    }

    /// Replace the bounds with the preset's width pair, mirrored onto
    /// the height bounds
    pub fn apply_preset(&mut self, preset: SensitivityPreset, config: &DetectionConfig) {
        let min = match preset {
            SensitivityPreset::Less => config.less_sensitivity,
            SensitivityPreset::Default => config.min_width,
            SensitivityPreset::More => config.more_sensitivity,
        };
        let max = config.max_width;

        self.min_width = min;
        self.max_width = max;
        self.min_height = min;
        self.max_height = max;
    }

    /// Name of the tier currently in effect, keyed by the minimum width
    pub fn tier(&self, config: &DetectionConfig) -> SensitivityPreset {
        if self.min_width == config.less_sensitivity {
            SensitivityPreset::Less
        } else if self.min_width == config.more_sensitivity {
            SensitivityPreset::More
        } else {
            SensitivityPreset::Default
        }
    }

    fn accepts(&self, width: u32, height: u32) -> bool {
        width >= self.min_width
            && width <= self.max_width
            && height >= self.min_height
            && height <= self.max_height
    }
}

/// Exponentially weighted average of past blurred grayscale frames.
///
/// Empty until the first frame seeds it; never cleared after that, so a
/// scene change is absorbed over a few frames instead of resetting.
#[derive(Debug, Default)]
pub struct BackgroundModel {
    accum: Option<FloatImage>,
}

impl BackgroundModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self) -> bool {
        self.accum.is_some()
    }

    fn seed(&mut self, gray: &GrayImage) {
        let accum = FloatImage::from_fn(gray.width(), gray.height(), |x, y| {
            Luma([gray.get_pixel(x, y).0[0] as f32])
        });
        self.accum = Some(accum);
    }

    /// Fold the current frame in with equal weight
    fn update(&mut self, gray: &GrayImage) {
        if let Some(accum) = self.accum.as_mut() {
            for (acc, cur) in accum.pixels_mut().zip(gray.pixels()) {
                acc.0[0] = acc.0[0] * 0.5 + cur.0[0] as f32 * 0.5;
            }
        }
    }

    fn rounded(&self) -> Option<GrayImage> {
        self.accum.as_ref().map(|accum| {
            GrayImage::from_fn(accum.width(), accum.height(), |x, y| {
                Luma([accum.get_pixel(x, y).0[0].round().clamp(0.0, 255.0) as u8])
            })
        })
    }
}

/// Change detector comparing each frame against the background model
pub struct MotionDetector {
    delta_threshold: u8,
}

impl MotionDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            delta_threshold: config.delta_threshold,
        }
    }

    /// Decide whether the frame shows qualifying motion.
    ///
    /// The first frame seeds the model and never reports motion. After
    /// that a detection requires the largest changed region's bounding
    /// box to fall inside the sensitivity bounds and the minimum
    /// capture interval to have elapsed.
    pub fn detect(
        &self,
        frame: &Frame,
        model: &mut BackgroundModel,
        sensitivity: &Sensitivity,
        min_interval: Duration,
        last_capture: Duration,
        now: Duration,
    ) -> Result<bool, CaptureError> {
        let gray = frame.to_luma()?;
        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);

        if !model.is_seeded() {
            model.seed(&blurred);
            trace!("background model seeded");
            return Ok(false);
        }

        // Resolution changes invalidate the model; start over
        if let Some(accum) = model.accum.as_ref() {
            if accum.dimensions() != blurred.dimensions() {
                warn!(
                    "frame dimensions changed from {:?} to {:?}, reseeding model",
                    accum.dimensions(),
                    blurred.dimensions()
                );
                model.seed(&blurred);
                return Ok(false);
            }
        }

        model.update(&blurred);
        let reference = match model.rounded() {
            Some(reference) => reference,
            None => return Ok(false),
        };

        let delta = map_colors2(&blurred, &reference, |cur, avg| {
            Luma([cur.0[0].abs_diff(avg.0[0])])
        });
        let binary = threshold(&delta, self.delta_threshold);
        let cleaned = dilate(&binary, Norm::LInf, 2);

        let contours = find_contours::<i32>(&cleaned);
        let largest = match largest_external_contour(&contours) {
            Some(contour) => contour,
            None => return Ok(false),
        };

        let (width, height) = bounding_box(&largest.points);
        if !sensitivity.accepts(width, height) {
            trace!(width, height, "motion region outside accepted bounds");
            return Ok(false);
        }

        let elapsed = now.checked_sub(last_capture).unwrap_or(Duration::ZERO);
        if elapsed < min_interval {
            trace!(?elapsed, ?min_interval, "motion suppressed by capture interval");
            return Ok(false);
        }

        debug!(width, height, "qualifying motion detected");
        Ok(true)
    }
}

/// Largest outermost contour by enclosed area; the first one wins ties
fn largest_external_contour<'a>(contours: &'a [Contour<i32>]) -> Option<&'a Contour<i32>> {
    let mut best: Option<(&Contour<i32>, f64)> = None;
    for contour in contours.iter().filter(|c| c.parent.is_none()) {
        let area = polygon_area(&contour.points);
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((contour, area)),
        }
    }
    best.map(|(contour, _)| contour)
}

/// Shoelace formula over the contour polygon
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let mut sum = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        sum += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (sum.abs() as f64) / 2.0
}

fn bounding_box(points: &[Point<i32>]) -> (u32, u32) {
    if points.is_empty() {
        return (0, 0);
    }

    let mut min_x = i32::MAX;
    let mut max_x = i32::MIN;
    let mut min_y = i32::MAX;
    let mut max_y = i32::MIN;
    for point in points {
        min_x = min_x.min(point.x);
        max_x = max_x.max(point.x);
        min_y = min_y.min(point.y);
        max_y = max_y.max(point.y);
    }

    ((max_x - min_x + 1) as u32, (max_y - min_y + 1) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrailcamConfig;

    const MD_WIDTH: u32 = 320;
    const MD_HEIGHT: u32 = 240;

    fn detection_config() -> DetectionConfig {
        TrailcamConfig::default().detection
    }

    fn black_frame(id: u64) -> Frame {
        Frame::new(id, vec![0u8; (MD_WIDTH * MD_HEIGHT * 3) as usize], MD_WIDTH, MD_HEIGHT)
    }

    /// Black frame with one or more white rectangles
    fn frame_with_rects(id: u64, rects: &[(u32, u32, u32, u32)]) -> Frame {
        let mut data = vec![0u8; (MD_WIDTH * MD_HEIGHT * 3) as usize];
        for &(x0, y0, w, h) in rects {
            for y in y0..(y0 + h).min(MD_HEIGHT) {
                for x in x0..(x0 + w).min(MD_WIDTH) {
                    let offset = ((y * MD_WIDTH + x) * 3) as usize;
                    data[offset] = 255;
                    data[offset + 1] = 255;
                    data[offset + 2] = 255;
                }
            }
        }
        Frame::new(id, data, MD_WIDTH, MD_HEIGHT)
    }

    fn bounds(min: u32, max: u32) -> Sensitivity {
        Sensitivity {
            min_width: min,
            max_width: max,
            min_height: min,
            max_height: max,
        }
    }

    #[test]
    fn test_first_frame_seeds_without_motion() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        assert!(!model.is_seeded());

        let motion = detector
            .detect(
                &frame_with_rects(1, &[(100, 80, 50, 50)]),
                &mut model,
                &bounds(20, 200),
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(100),
            )
            .unwrap();

        assert!(!motion);
        assert!(model.is_seeded());
    }

    #[test]
    fn test_static_scene_reports_no_motion() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        let sensitivity = bounds(20, 200);

        for tick in 0..3u64 {
            let motion = detector
                .detect(
                    &black_frame(tick + 1),
                    &mut model,
                    &sensitivity,
                    Duration::ZERO,
                    Duration::ZERO,
                    Duration::from_secs(tick),
                )
                .unwrap();
            assert!(!motion);
        }
    }

    #[test]
    fn test_bright_square_triggers_and_interval_suppresses() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        let sensitivity = bounds(20, 200);
        let square = frame_with_rects(2, &[(100, 80, 50, 50)]);

        // Seed from an empty scene
        assert!(!detector
            .detect(
                &black_frame(1),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(1000),
            )
            .unwrap());

        // Qualifying region with no interval restriction
        let motion = detector
            .detect(
                &square,
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::from_secs(1000),
                Duration::from_secs(1000),
            )
            .unwrap();
        assert!(motion);

        // Same region 10ms later, but inside the 5s capture interval
        let motion = detector
            .detect(
                &square,
                &mut model,
                &sensitivity,
                Duration::from_secs(5),
                Duration::from_secs(1000),
                Duration::from_secs(1000) + Duration::from_millis(10),
            )
            .unwrap();
        assert!(!motion);
    }

    #[test]
    fn test_region_below_minimum_is_rejected() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        let sensitivity = bounds(50, 200);

        assert!(!detector
            .detect(
                &black_frame(1),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
            )
            .unwrap());

        // A 10x10 patch stays well under the 50px minimum even after
        // blur and dilation spread it
        let motion = detector
            .detect(
                &frame_with_rects(2, &[(150, 110, 10, 10)]),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(!motion);
    }

    #[test]
    fn test_region_above_maximum_is_rejected() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        let sensitivity = bounds(20, 200);

        assert!(!detector
            .detect(
                &black_frame(1),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
            )
            .unwrap());

        let motion = detector
            .detect(
                &frame_with_rects(2, &[(50, 70, 210, 100)]),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(!motion);
    }

    #[test]
    fn test_largest_region_decides() {
        let detector = MotionDetector::new(&detection_config());
        let mut model = BackgroundModel::new();
        // Only regions of at least 60px qualify
        let sensitivity = bounds(60, 200);

        assert!(!detector
            .detect(
                &black_frame(1),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::ZERO,
            )
            .unwrap());

        // A 20px patch and an 80px patch; the larger one must be the
        // one gated against the bounds
        let motion = detector
            .detect(
                &frame_with_rects(2, &[(20, 20, 20, 20), (180, 120, 80, 80)]),
                &mut model,
                &sensitivity,
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(10),
            )
            .unwrap();
        assert!(motion);
    }

    #[test]
    fn test_preset_application_is_idempotent() {
        let config = detection_config();
        let mut sensitivity = Sensitivity::from_config(&config);

        sensitivity.apply_preset(SensitivityPreset::Less, &config);
        let first = sensitivity;
        sensitivity.apply_preset(SensitivityPreset::Less, &config);
        assert_eq!(first, sensitivity);

        assert_eq!(sensitivity.min_width, config.less_sensitivity);
        assert_eq!(sensitivity.max_width, config.max_width);
        // Heights mirror widths
        assert_eq!(sensitivity.min_height, sensitivity.min_width);
        assert_eq!(sensitivity.max_height, sensitivity.max_width);
    }

    #[test]
    fn test_tier_reverse_mapping() {
        let config = detection_config();
        let mut sensitivity = Sensitivity::from_config(&config);
        assert_eq!(sensitivity.tier(&config), SensitivityPreset::Default);

        sensitivity.apply_preset(SensitivityPreset::More, &config);
        assert_eq!(sensitivity.tier(&config), SensitivityPreset::More);

        sensitivity.apply_preset(SensitivityPreset::Less, &config);
        assert_eq!(sensitivity.tier(&config), SensitivityPreset::Less);
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!(
            "less".parse::<SensitivityPreset>().unwrap(),
            SensitivityPreset::Less
        );
        assert_eq!(
            "default".parse::<SensitivityPreset>().unwrap(),
            SensitivityPreset::Default
        );
        assert_eq!(
            "more".parse::<SensitivityPreset>().unwrap(),
            SensitivityPreset::More
        );
        assert!(matches!(
            "extreme".parse::<SensitivityPreset>(),
            Err(SessionError::InvalidPreset { .. })
        ));
    }

    #[test]
    fn test_polygon_area() {
        let square = vec![
            Point::new(0, 0),
            Point::new(10, 0),
            Point::new(10, 10),
            Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&square), 100.0);
        assert_eq!(polygon_area(&square[..2]), 0.0);
    }

    #[test]
    fn test_bounding_box() {
        let points = vec![Point::new(5, 7), Point::new(20, 7), Point::new(12, 30)];
        assert_eq!(bounding_box(&points), (16, 24));
        assert_eq!(bounding_box(&[]), (0, 0));
    }
}

use std::time::Duration;
use trailcam::{
    BackgroundModel, Frame, MotionDetector, Sensitivity, SensitivityPreset, TrailcamConfig,
};
use tracing::{info, Level};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting motion detector demo");

    let config = TrailcamConfig::default().detection;
    let detector = MotionDetector::new(&config);

    // Part 1: default sensitivity sees a large bright region
    let mut model = BackgroundModel::new();
    let mut sensitivity = Sensitivity::from_config(&config);

    let background = solid_frame(0, [40, 40, 40]);
    let motion = detector.detect(
        &background,
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(1),
    )?;
    info!("Frame 0 (background): motion = {} (model seeded)", motion);

    let still = detector.detect(
        &solid_frame(1, [40, 40, 40]),
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(2),
    )?;
    info!("Frame 1 (unchanged): motion = {}", still);

    let large = square_frame(2, 130, 90, 60);
    let detected = detector.detect(
        &large,
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(3),
    )?;
    info!(
        "Frame 2 (60px square): motion = {} at the '{}' tier",
        detected,
        sensitivity.tier(&config).as_str()
    );

    // Part 2: the low-sensitivity preset filters small regions out
    let mut model = BackgroundModel::new();
    sensitivity.apply_preset(SensitivityPreset::Less, &config);

    detector.detect(
        &solid_frame(3, [40, 40, 40]),
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(4),
    )?;
    let small = square_frame(4, 150, 110, 16);
    let filtered = detector.detect(
        &small,
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(5),
    )?;
    info!(
        "Frame 4 (16px square): motion = {} at the '{}' tier",
        filtered,
        sensitivity.tier(&config).as_str()
    );

    // Part 3: the high-sensitivity preset accepts the same small region
    let mut model = BackgroundModel::new();
    sensitivity.apply_preset(SensitivityPreset::More, &config);

    detector.detect(
        &solid_frame(5, [40, 40, 40]),
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(6),
    )?;
    let accepted = detector.detect(
        &square_frame(6, 150, 110, 16),
        &mut model,
        &sensitivity,
        Duration::ZERO,
        Duration::ZERO,
        Duration::from_secs(7),
    )?;
    info!(
        "Frame 6 (16px square): motion = {} at the '{}' tier",
        accepted,
        sensitivity.tier(&config).as_str()
    );

    info!("Motion detector demo completed");
    Ok(())
}

/// Uniform 320x240 frame
fn solid_frame(id: u64, rgb: [u8; 3]) -> Frame {
    let (width, height) = (320u32, 240u32);
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..(width * height) {
        data.extend_from_slice(&rgb);
    }
    Frame::new(id, data, width, height)
}

/// Dark 320x240 frame with a bright square of the given side length
fn square_frame(id: u64, left: u32, top: u32, side: u32) -> Frame {
    let (width, height) = (320u32, 240u32);
    let mut data = vec![40u8; (width * height * 3) as usize];
    for y in top..(top + side) {
        for x in left..(left + side) {
            let offset = ((y * width + x) * 3) as usize;
            data[offset] = 250;
            data[offset + 1] = 250;
            data[offset + 2] = 250;
        }
    }
    Frame::new(id, data, width, height)
}

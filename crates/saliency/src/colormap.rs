//! Fixed colour ramp and overlay blending
use image::{Rgb, RgbImage};

/// Jet ramp (dark blue → cyan → yellow → dark red) for a value in `[0, 1]`
///
/// The input is first quantized to 8 bits, as an 8-bit lookup table would.
#[must_use]
pub fn jet(value: f32) -> Rgb<u8> {
    let level = (value.clamp(0.0, 1.0) * 255.0) as u8;
    let v = f32::from(level) / 255.0;
    let channel = |centre: f32| {
        let c = (1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// `base * image_weight + heat * heatmap_weight`, rounded and saturated per channel
#[must_use]
pub fn blend(base: &RgbImage, heat: &RgbImage, image_weight: f32, heatmap_weight: f32) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y);
        let h = heat.get_pixel(x, y);
        let mix = |c: usize| {
            (f32::from(b[c]) * image_weight + f32::from(h[c]) * heatmap_weight)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([mix(0), mix(1), mix(2)])
    })
}

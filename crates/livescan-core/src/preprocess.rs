//! Frame preprocessing shared by both image classifiers.
//!
//! The steps and constants must match what the classifiers were trained with:
//! resize to 224×224, scale to `[0, 1]`, then ImageNet per-channel
//! normalization, laid out NCHW.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;

/// Side length of the square classifier input.
pub const INPUT_SIZE: usize = 224;

/// Per-channel mean (RGB) applied after scaling to `[0, 1]`.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation (RGB).
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Normalized classifier input of shape `(1, 3, 224, 224)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor(Array4<f32>);

impl FeatureTensor {
    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    /// Flattened values in standard (row-major NCHW) order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.0.iter().copied().collect()
    }
}

/// Resize, scale and normalize an RGB frame into a [`FeatureTensor`].
///
/// Bilinear resampling with antialiasing (`Triangle`) is used so that
/// downscaled camera frames match the training-time resize.
pub fn preprocess(image: &RgbImage) -> FeatureTensor {
    let resized = if image.dimensions() == (INPUT_SIZE as u32, INPUT_SIZE as u32) {
        image.clone()
    } else {
        image::imageops::resize(
            image,
            INPUT_SIZE as u32,
            INPUT_SIZE as u32,
            FilterType::Triangle,
        )
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let scaled = f32::from(pixel[c]) / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (scaled - MEAN[c]) / STD[c];
        }
    }

    FeatureTensor(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_output_shape() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 64, 32]));
        let tensor = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(tensor.to_vec().len(), 3 * INPUT_SIZE * INPUT_SIZE);
    }

    #[test]
    fn test_solid_color_normalization() {
        let img = RgbImage::from_pixel(INPUT_SIZE as u32, INPUT_SIZE as u32, Rgb([255, 0, 128]));
        let tensor = preprocess(&img);
        let arr = tensor.as_array();

        let expected = [
            (1.0 - MEAN[0]) / STD[0],
            (0.0 - MEAN[1]) / STD[1],
            (128.0 / 255.0 - MEAN[2]) / STD[2],
        ];
        for (c, want) in expected.iter().enumerate() {
            assert!((arr[[0, c, 0, 0]] - want).abs() < 1e-5);
            assert!((arr[[0, c, 223, 111]] - want).abs() < 1e-5);
        }
    }

    #[test]
    fn test_channel_layout_is_nchw() {
        // Left half red, right half blue: channel 0 differs across x, channel 2 mirrors it.
        let img = RgbImage::from_fn(INPUT_SIZE as u32, INPUT_SIZE as u32, |x, _| {
            if x < 112 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let arr = preprocess(&img).as_array().clone();
        assert!(arr[[0, 0, 10, 0]] > arr[[0, 0, 10, 200]]);
        assert!(arr[[0, 2, 10, 0]] < arr[[0, 2, 10, 200]]);
    }

    #[test]
    fn test_deterministic() {
        let img = RgbImage::from_fn(300, 200, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 7]));
        assert_eq!(preprocess(&img), preprocess(&img));
    }
}

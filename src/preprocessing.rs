use crate::{config::TensorLayout, error::ErrorCode};
use image::{
    imageops::{self, FilterType},
    DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage, Rgba, RgbaImage,
};
use ndarray::Array4;
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Uploaded file is empty")]
    Empty,
    #[error("Unrecognized image data")]
    Unrecognized,
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid image file: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image has no pixels")]
    NoPixels,
}

impl PreprocessError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::UnsupportedImage
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    pub original_format: String,
    pub width: u32,
    pub height: u32,
    pub file_size_bytes: usize,
    pub converted: bool,
}

#[derive(Debug)]
pub struct PreprocessedImage {
    pub tensor: Array4<f32>,
    pub info: ImageInfo,
}

fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_uppercase()
}

/// Decodes uploads and produces the `[0, 1]` scaled tensor the model expects.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    input_size: u32,
    layout: TensorLayout,
    filter: FilterType,
    supported: Vec<ImageFormat>,
}

impl ImagePreprocessor {
    pub fn new(
        input_size: u32,
        layout: TensorLayout,
        filter: FilterType,
        supported: Vec<ImageFormat>,
    ) -> Self {
        Self {
            input_size,
            layout,
            filter,
            supported,
        }
    }

    pub fn supported_formats_message(&self) -> String {
        self.supported
            .iter()
            .map(|f| format_name(*f))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn preprocess(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<PreprocessedImage, PreprocessError> {
        if bytes.is_empty() {
            return Err(PreprocessError::Empty);
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PreprocessError::Decode(e.into()))?;
        // The declared type is only a hint for data the sniffer can't place.
        if reader.format().is_none() {
            if let Some(format) = content_type.and_then(ImageFormat::from_mime_type) {
                reader.set_format(format);
            }
        }
        let format = reader.format().ok_or(PreprocessError::Unrecognized)?;
        if !self.supported.contains(&format) {
            return Err(PreprocessError::UnsupportedFormat(format_name(format)));
        }

        let image = reader.decode()?;
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(PreprocessError::NoPixels);
        }
        tracing::debug!(format = ?format, width, height, color = ?image.color(), "Decoded upload");

        let (rgb, converted) = to_rgb(image);
        let resized = imageops::resize(&rgb, self.input_size, self.input_size, self.filter);

        Ok(PreprocessedImage {
            tensor: self.to_tensor(&resized),
            info: ImageInfo {
                original_format: format_name(format),
                width,
                height,
                file_size_bytes: bytes.len(),
                converted,
            },
        })
    }

    fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let size = self.input_size as usize;
        let mut input = match self.layout {
            TensorLayout::Nhwc => Array4::zeros((1, size, size, 3)),
            TensorLayout::Nchw => Array4::zeros((1, 3, size, size)),
        };

        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for (channel, value) in pixel.0.iter().enumerate() {
                let value = f32::from(*value) / 255.;
                match self.layout {
                    TensorLayout::Nhwc => input[[0, y, x, channel]] = value,
                    TensorLayout::Nchw => input[[0, channel, y, x]] = value,
                }
            }
        }

        input
    }
}

fn to_rgb(image: DynamicImage) -> (RgbImage, bool) {
    match image {
        DynamicImage::ImageRgb8(rgb) => (rgb, false),
        other if other.color().has_alpha() => (flatten_on_white(&other.to_rgba8()), true),
        other => (other.to_rgb8(), true),
    }
}

fn flatten_on_white(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let alpha = f32::from(a) / 255.;
        let blend = |c: u8| (f32::from(c) * alpha + 255. * (1. - alpha)).round() as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, QrCode, render::unicode::Dense1x2};

/// Turns a pairing payload into something a phone camera can scan.
pub trait CodeRenderer: Send + Sync {
    fn png(&self, data: &str) -> Result<Vec<u8>>;

    /// Block-character rendering for terminals and log output.
    fn terminal(&self, data: &str) -> Result<String>;
}

/// `data:` URL suitable for an `<img src>`.
pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

#[derive(Debug, Clone, Copy)]
pub struct QrRenderer {
    module_px: u32,
    quiet_zone: u32,
}

impl Default for QrRenderer {
    fn default() -> Self {
        Self {
            module_px: 8,
            quiet_zone: 4,
        }
    }
}

impl QrRenderer {
    pub fn new(module_px: u32, quiet_zone: u32) -> Self {
        Self {
            module_px: module_px.max(1),
            quiet_zone,
        }
    }
}

impl CodeRenderer for QrRenderer {
    fn png(&self, data: &str) -> Result<Vec<u8>> {
        let code = QrCode::new(data.as_bytes()).context("encode pairing code as QR")?;
        let width = code.width() as u32;
        let colors = code.to_colors();
        let scale = self.module_px;
        let quiet = self.quiet_zone;
        let side = (width + 2 * quiet) * scale;

        let img = GrayImage::from_fn(side, side, |x, y| {
            let (mx, my) = (x / scale, y / scale);
            let outside = mx < quiet || my < quiet || mx >= width + quiet || my >= width + quiet;
            if outside {
                return Luma([255u8]);
            }
            let idx = ((my - quiet) * width + (mx - quiet)) as usize;
            match colors.get(idx) {
                Some(Color::Dark) => Luma([0u8]),
                _ => Luma([255u8]),
            }
        });

        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png)
            .context("encode pairing code PNG")?;
        Ok(out.into_inner())
    }

    fn terminal(&self, data: &str) -> Result<String> {
        let code = QrCode::new(data.as_bytes()).context("encode pairing code as QR")?;
        Ok(code
            .render::<Dense1x2>()
            .dark_color(Dense1x2::Light)
            .light_color(Dense1x2::Dark)
            .build())
    }
}

//! Capture: screenshot bytes out of the viewer and onto disk

use crate::viewer::ViewerPage;
use crate::{Error, Result};
use base64::Engine as Base64Engine;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First eight bytes of every PNG file
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Where the image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CaptureMethod {
    /// Browser screenshot clipped to the viewer's canvas element
    #[default]
    Element,
    /// Image produced by the viewer itself (`tcvGetImage`)
    ViewerImage,
}

/// Grab the rendered frame for `model` and write it to `output`
pub fn capture<P: ViewerPage>(
    page: &mut P,
    method: CaptureMethod,
    selector: &str,
    model: &str,
    output: &Path,
    timeout: Duration,
) -> Result<PathBuf> {
    let fail = |reason: String| Error::CaptureError { model: model.to_string(), reason };

    let bytes = match method {
        CaptureMethod::Element => page
            .capture_element_png(selector, timeout)
            .map_err(|e| fail(e.to_string()))?
            .ok_or_else(|| fail(format!("viewer element `{}` not found", selector)))?,
        CaptureMethod::ViewerImage => {
            let value = page.evaluate("window.tcvGetImage()").map_err(|e| fail(e.to_string()))?;
            let url = value.as_str().ok_or_else(|| fail(format!("viewer returned {} instead of an image", value)))?;
            decode_data_url(url).map_err(fail)?
        }
    };

    write_png(model, &bytes, output)
}

/// Decode a `data:image/png;base64,...` URL
pub fn decode_data_url(url: &str) -> std::result::Result<Vec<u8>, String> {
    let (header, data) = url.split_once(',').ok_or_else(|| "not a data URL".to_string())?;
    if !header.starts_with("data:") || !header.ends_with(";base64") {
        return Err(format!("expected a base64 data URL, got `{}`", header));
    }
    Base64Engine::decode(&base64::engine::general_purpose::STANDARD, data.trim()).map_err(|e| e.to_string())
}

/// Write PNG `bytes` to `output`, creating parent directories and replacing
/// any existing file.
pub fn write_png(model: &str, bytes: &[u8], output: &Path) -> Result<PathBuf> {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return Err(Error::CaptureError {
            model: model.to_string(),
            reason: format!("captured {} bytes that are not a PNG image", bytes.len()),
        });
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(output, bytes)?;
    log::info!("wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tiny_png() -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut enc = png::Encoder::new(&mut out, 1, 1);
            enc.set_color(png::ColorType::Rgba);
            enc.set_depth(png::BitDepth::Eight);
            let mut w = enc.write_header().unwrap();
            w.write_image_data(&[255, 0, 0, 255]).unwrap();
        }
        out
    }

    #[test]
    fn writes_into_missing_directories_and_overwrites() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("nested/shots/box.png");
        let png = tiny_png();
        write_png("box", &png, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), png);

        let mut again = png.clone();
        again.extend_from_slice(b"trailer");
        write_png("box", &again, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), again);
    }

    #[test]
    fn rejects_non_png_bytes() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("x.png");
        match write_png("x", b"GIF89a", &out) {
            Err(Error::CaptureError { model, .. }) => assert_eq!(model, "x"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn decodes_png_data_urls() {
        let png = tiny_png();
        let url = format!("data:image/png;base64,{}", base64::engine::general_purpose::STANDARD.encode(&png));
        assert_eq!(decode_data_url(&url).unwrap(), png);
        assert!(decode_data_url("data:image/png,raw").is_err());
        assert!(decode_data_url("no comma here").is_err());
    }
}

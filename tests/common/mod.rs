//! In-memory viewer page for pipeline tests

#![allow(dead_code)]

use base64::Engine as _;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tcv_screenshots::{BridgeConfig, ConsoleMessage, Error, Result, ViewerBridge, ViewerPage};

/// What the fake viewer does and what it saw
#[derive(Debug)]
pub struct FakeViewer {
    pub navigations: usize,
    pub responsive: bool,
    pub never_ready: bool,
    /// Models that stay "rendering" forever
    pub hang: HashSet<String>,
    /// After a hang the page stops answering until reloaded
    pub wedge_on_hang: bool,
    pub missing_canvas: bool,
    pub polls_before_complete: usize,
    pub current: Option<(String, usize)>,
    pub payloads: Vec<Value>,
    pub resets: usize,
    pub camera_reads: usize,
    pub console: Vec<ConsoleMessage>,
    /// Longest limit any bounded evaluation was given
    pub longest_eval_limit: Option<Duration>,
}

impl Default for FakeViewer {
    fn default() -> Self {
        Self {
            navigations: 0,
            responsive: false,
            never_ready: false,
            hang: HashSet::new(),
            wedge_on_hang: false,
            missing_canvas: false,
            polls_before_complete: 2,
            current: None,
            payloads: Vec::new(),
            resets: 0,
            camera_reads: 0,
            console: Vec::new(),
            longest_eval_limit: None,
        }
    }
}

impl FakeViewer {
    pub fn loaded_names(&self) -> Vec<String> {
        self.payloads.iter().map(|p| p["name"].as_str().unwrap_or_default().to_string()).collect()
    }

    fn current_size(&self) -> (u32, u32) {
        let display = &self.payloads.last().map(|p| p["config"]["display"].clone()).unwrap_or(Value::Null);
        let dim = |k: &str, d: u64| display.get(k).and_then(Value::as_u64).unwrap_or(d) as u32;
        (dim("cadWidth", 1200), dim("height", 800))
    }
}

pub struct FakePage {
    pub viewer: Rc<RefCell<FakeViewer>>,
}

fn unresponsive() -> Error {
    Error::Other("page is not responding".into())
}

impl ViewerPage for FakePage {
    fn navigate(&mut self, url: &str) -> Result<()> {
        assert!(url.starts_with("data:text/html;base64,"));
        let mut v = self.viewer.borrow_mut();
        v.navigations += 1;
        v.responsive = !v.never_ready;
        v.current = None;
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let mut v = self.viewer.borrow_mut();
        if !v.responsive {
            return Err(unresponsive());
        }
        if expression == "window.tcvViewerReady === true" {
            return Ok(Value::Bool(true));
        }
        if let Some(rest) = expression.strip_prefix("window.tcvLoadModel(") {
            let payload: Value = serde_json::from_str(rest.strip_suffix(')').unwrap()).unwrap();
            let name = payload["name"].as_str().unwrap().to_string();
            v.payloads.push(payload);
            v.current = Some((name, 0));
            v.console.push(ConsoleMessage { level: "warn".into(), text: "Unknown option tab".into() });
            return Ok(Value::Bool(true));
        }
        match expression {
            "window.tcvRenderState()" => {
                let polls_before_complete = v.polls_before_complete;
                let wedge = v.wedge_on_hang;
                let hanging = v.current.as_ref().map_or(false, |(name, _)| v.hang.contains(name));
                if hanging {
                    if wedge {
                        v.responsive = false;
                    }
                    return Ok(json!("rendering"));
                }
                match v.current.as_mut() {
                    None => Ok(json!("idle")),
                    Some((_, polls)) if *polls >= polls_before_complete => Ok(json!("complete")),
                    Some((_, polls)) => {
                        *polls += 1;
                        Ok(json!("rendering"))
                    }
                }
            }
            "window.tcvReset()" => {
                v.resets += 1;
                v.current = None;
                Ok(Value::Bool(true))
            }
            "window.tcvCameraState()" => {
                v.camera_reads += 1;
                Ok(json!({ "position": [1, 1, 1], "quaternion": [0, 0, 0, 1], "target": [0, 0, 0], "zoom": 1.0 }))
            }
            "window.tcvGetImage()" => {
                let (w, h) = v.current_size();
                let b64 = base64::engine::general_purpose::STANDARD.encode(png_bytes(w, h));
                Ok(json!(format!("data:image/png;base64,{}", b64)))
            }
            other => Err(Error::Other(format!("unexpected expression {}", other))),
        }
    }

    fn evaluate_within(&mut self, expression: &str, timeout: Duration) -> Result<Value> {
        {
            let mut v = self.viewer.borrow_mut();
            v.longest_eval_limit = v.longest_eval_limit.max(Some(timeout));
        }
        self.evaluate(expression)
    }

    fn capture_element_png(&mut self, _selector: &str, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        let v = self.viewer.borrow();
        if !v.responsive {
            return Err(unresponsive());
        }
        if v.missing_canvas {
            return Ok(None);
        }
        let (w, h) = v.current_size();
        Ok(Some(png_bytes(w, h)))
    }

    fn drain_console(&mut self) -> Vec<ConsoleMessage> {
        std::mem::take(&mut self.viewer.borrow_mut().console)
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Grayscale PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut enc = png::Encoder::new(&mut out, width, height);
        enc.set_color(png::ColorType::Grayscale);
        enc.set_depth(png::BitDepth::Eight);
        let mut w = enc.write_header().unwrap();
        w.write_image_data(&vec![200u8; (width * height) as usize]).unwrap();
    }
    out
}

pub fn png_size(path: &Path) -> (u32, u32) {
    let decoder = png::Decoder::new(std::fs::File::open(path).unwrap());
    let reader = decoder.read_info().unwrap();
    let info = reader.info();
    (info.width, info.height)
}

/// Short timeouts so failure paths finish quickly
pub fn quick_config() -> BridgeConfig {
    BridgeConfig {
        init_timeout_ms: 200,
        render_timeout_ms: 50,
        poll_interval_ms: 1,
        settle_ms: 0,
        ..BridgeConfig::default()
    }
}

pub fn open_bridge(viewer: &Rc<RefCell<FakeViewer>>, config: BridgeConfig) -> ViewerBridge<FakePage> {
    ViewerBridge::open(FakePage { viewer: viewer.clone() }, config).unwrap()
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Script registering one box per name, returning the registry snapshot
pub fn boxes_script(names: &[&str]) -> String {
    let saves: String = names
        .iter()
        .enumerate()
        .map(|(i, n)| format!("    save_model({{ solid: 'box', size: [{}, 1, 1] }}, '{}');\n", i + 1, n))
        .collect();
    format!(
        "const {{ save_model, get_saved_models }} = require('tcv_screenshots');\n\nfunction main() {{\n{}    return get_saved_models();\n}}\n",
        saves
    )
}

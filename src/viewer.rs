//! Viewer bridge: drives the three-cad-viewer page through one render job at
//! a time and decides when the frame is safe to capture.
//!
//! The page side of the protocol lives in `assets/viewer.html`:
//!
//! - `window.tcvViewerReady` becomes `true` once the viewer module is loaded
//! - `window.tcvLoadModel(payload)` starts a render and returns `true`
//! - `window.tcvRenderState()` reports `"idle"`, `"rendering"`, `"complete"`
//!   or `"error: <message>"`
//! - `window.tcvReset()`, `window.tcvCameraState()` and `window.tcvGetImage()`
//!   support recovery, pause mode and viewer-side capture

use crate::capture::{self, CaptureMethod};
use crate::config::RenderConfig;
use crate::serializer::SerializedModel;
use crate::{Error, Result};
use base64::Engine as Base64Engine;
use log::{debug, info, warn, Level};
use serde_json::{json, Value};
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const VIEWER_TEMPLATE: &str = include_str!("../assets/viewer.html");

/// Published ESM build of three-cad-viewer loaded by the page
pub const DEFAULT_VIEWER_MODULE_URL: &str = "https://cdn.jsdelivr.net/npm/three-cad-viewer@3.2.2/dist/three-cad-viewer.esm.js";

/// Stylesheet matching [`DEFAULT_VIEWER_MODULE_URL`]
pub const DEFAULT_VIEWER_CSS_URL: &str = "https://cdn.jsdelivr.net/npm/three-cad-viewer@3.2.2/dist/three-cad-viewer.css";

const READY_EXPR: &str = "window.tcvViewerReady === true";
const RENDER_STATE_EXPR: &str = "window.tcvRenderState()";

/// Console message emitted by the page
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    /// Level such as "log", "warn", "error" or "pageerror"
    pub level: String,
    /// Textual content of the message
    pub text: String,
}

/// The browser automation surface the bridge needs.
///
/// `CdpPage` implements this over headless Chrome; tests substitute an
/// in-memory page.
pub trait ViewerPage {
    /// Load `url` and wait for navigation to finish
    fn navigate(&mut self, url: &str) -> Result<()>;

    /// Evaluate `expression` in the page, awaiting promises, and return its JSON value
    fn evaluate(&mut self, expression: &str) -> Result<Value>;

    /// Like [`evaluate`](Self::evaluate), but gives up after `timeout`
    fn evaluate_within(&mut self, expression: &str, timeout: Duration) -> Result<Value> {
        let _ = timeout;
        self.evaluate(expression)
    }

    /// PNG screenshot of the first element matching `selector`, or `None`
    /// when no such element appears within `timeout`
    fn capture_element_png(&mut self, selector: &str, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Console messages received since the last call
    fn drain_console(&mut self) -> Vec<ConsoleMessage>;

    /// Release the page and its browser
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Timing and debug behaviour of the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How long to wait for the viewer page to initialise
    pub init_timeout_ms: u64,
    /// How long one model may take to signal render completion
    pub render_timeout_ms: u64,
    /// Delay between completion polls
    pub poll_interval_ms: u64,
    /// Extra time after completion before capturing
    pub settle_ms: u64,
    /// Element whose pixels make up the screenshot
    pub canvas_selector: String,
    pub capture: CaptureMethod,
    /// Wait for the resume hook between completion and capture
    pub pause: bool,
    /// Relay every console message instead of filtering
    pub forward_console: bool,
    pub viewer_module_url: String,
    pub viewer_css_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 10_000,
            render_timeout_ms: 30_000,
            poll_interval_ms: 100,
            settle_ms: 500,
            canvas_selector: "#tcv-viewer canvas".to_string(),
            capture: CaptureMethod::Element,
            pause: false,
            forward_console: false,
            viewer_module_url: DEFAULT_VIEWER_MODULE_URL.to_string(),
            viewer_css_url: DEFAULT_VIEWER_CSS_URL.to_string(),
        }
    }
}

/// One model to render and where its screenshot goes
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub model: SerializedModel,
    pub config: RenderConfig,
    pub output_path: PathBuf,
}

impl RenderJob {
    pub fn new(model: SerializedModel, config: RenderConfig, output_folder: &Path) -> Self {
        let output_path = output_folder.join(format!("{}.png", model.name));
        Self { model, config, output_path }
    }

    pub fn name(&self) -> &str {
        &self.model.name
    }

    /// What `tcvLoadModel` receives: the shapes document plus grouped options
    pub fn payload(&self) -> Value {
        json!({
            "name": self.model.name,
            "model": self.model.document,
            "config": self.config.split(),
        })
    }
}

/// Where the current job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Idle,
    Injected,
    Rendering,
    Complete,
    Paused,
    Captured,
    TimedOut,
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderState::Idle => "idle",
            RenderState::Injected => "injected",
            RenderState::Rendering => "rendering",
            RenderState::Complete => "complete",
            RenderState::Paused => "paused",
            RenderState::Captured => "captured",
            RenderState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

type ResumeHook = Box<dyn FnMut(&str) -> Result<()>>;

/// Owns the viewer page for a whole batch and renders jobs sequentially
pub struct ViewerBridge<P: ViewerPage> {
    page: P,
    config: BridgeConfig,
    state: RenderState,
    resume: ResumeHook,
}

impl<P: ViewerPage> ViewerBridge<P> {
    /// Load the viewer into `page` and wait for it to initialise
    pub fn open(page: P, config: BridgeConfig) -> Result<Self> {
        let mut bridge = Self {
            page,
            config,
            state: RenderState::Idle,
            resume: Box::new(wait_for_enter),
        };
        bridge.load_viewer()?;
        Ok(bridge)
    }

    /// Replace the pause-mode resume hook (stdin by default)
    pub fn with_resume<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&str) -> Result<()> + 'static,
    {
        self.resume = Box::new(hook);
        self
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    /// Render `job` and write its screenshot. On timeout the page is checked
    /// and reloaded if needed so the next job starts clean.
    pub fn render(&mut self, job: &RenderJob) -> Result<PathBuf> {
        self.state = RenderState::Idle;
        let result = self.run_job(job);
        self.relay_console();

        if let Err(e) = &result {
            if matches!(e, Error::RenderTimeoutError { .. }) {
                self.transition(job.name(), RenderState::TimedOut);
            }
            if let Err(recover_err) = self.recover() {
                warn!("viewer could not be recovered after '{}': {}", job.name(), recover_err);
            }
        }
        result
    }

    /// Release the page
    pub fn close(self) -> Result<()> {
        self.page.close()
    }

    fn run_job(&mut self, job: &RenderJob) -> Result<PathBuf> {
        let name = job.name().to_string();
        let payload = serde_json::to_string(&job.payload())
            .map_err(|e| Error::RenderError(format!("failed to encode '{}': {}", name, e)))?;

        let accepted = self.page.evaluate(&format!("window.tcvLoadModel({})", payload))?;
        if accepted != Value::Bool(true) {
            return Err(Error::RenderError(format!("viewer rejected '{}': {}", name, accepted)));
        }
        self.transition(&name, RenderState::Injected);
        self.transition(&name, RenderState::Rendering);

        let outcome = self.poll(RENDER_STATE_EXPR, self.config.render_timeout_ms, |v| match v.as_str() {
            Some("complete") => Some(Ok(())),
            Some(s) if s.starts_with("error") => Some(Err(s.to_string())),
            _ => None,
        });
        match outcome {
            None => {
                return Err(Error::RenderTimeoutError { model: name, timeout_ms: self.config.render_timeout_ms });
            }
            Some(Err(msg)) => return Err(Error::RenderError(format!("'{}': {}", name, msg))),
            Some(Ok(())) => {}
        }
        self.transition(&name, RenderState::Complete);
        self.relay_console();

        if self.config.settle_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.settle_ms));
        }

        if self.config.pause {
            self.transition(&name, RenderState::Paused);
            (self.resume)(&name)?;
            self.log_camera_state(&name);
        }

        let path = capture::capture(
            &mut self.page,
            self.config.capture,
            &self.config.canvas_selector,
            &name,
            &job.output_path,
            Duration::from_millis(self.config.init_timeout_ms),
        )?;
        self.transition(&name, RenderState::Captured);
        Ok(path)
    }

    fn load_viewer(&mut self) -> Result<()> {
        let url = viewer_page_url(&self.config.viewer_module_url, &self.config.viewer_css_url);
        self.page.navigate(&url)?;
        let ready = self.poll(READY_EXPR, self.config.init_timeout_ms, |v| v.as_bool().filter(|b| *b));
        self.relay_console();
        match ready {
            Some(_) => {
                debug!("viewer initialised");
                Ok(())
            }
            None => Err(Error::InitializationError(format!(
                "viewer did not signal readiness within {}ms",
                self.config.init_timeout_ms
            ))),
        }
    }

    /// Make sure the page can take the next job: reset a responsive viewer,
    /// reload one that stopped answering.
    fn recover(&mut self) -> Result<()> {
        let limit = Duration::from_millis(self.config.init_timeout_ms.max(1));
        let responsive = matches!(self.page.evaluate_within(READY_EXPR, limit), Ok(Value::Bool(true)));
        if responsive {
            self.page.evaluate("window.tcvReset()")?;
            return Ok(());
        }
        warn!("viewer page is unresponsive, reloading");
        self.load_viewer()
    }

    /// Evaluate `expression` every poll interval until `check` accepts the
    /// value or `timeout_ms` elapses. Evaluation failures count as "not yet".
    fn poll<T>(&mut self, expression: &str, timeout_ms: u64, check: impl Fn(&Value) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));
            match self.page.evaluate_within(expression, remaining) {
                Ok(v) => {
                    if let Some(done) = check(&v) {
                        return Some(done);
                    }
                }
                Err(e) => debug!("poll of `{}` failed: {}", expression, e),
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(interval.min(deadline - now));
        }
    }

    fn transition(&mut self, name: &str, next: RenderState) {
        debug!("'{}': {} -> {}", name, self.state, next);
        self.state = next;
    }

    fn relay_console(&mut self) {
        for msg in self.page.drain_console() {
            if let Some(level) = console_level(&msg, self.config.forward_console) {
                log::log!(target: "tcv_screenshots::browser", level, "[{}] {}", msg.level, msg.text);
            }
        }
    }

    fn log_camera_state(&mut self, name: &str) {
        match self.page.evaluate("window.tcvCameraState()") {
            Ok(state) => {
                info!("camera for '{}':", name);
                for key in ["position", "quaternion", "target", "zoom"] {
                    info!("  {}: {}", key, state.get(key).unwrap_or(&Value::Null));
                }
            }
            Err(e) => warn!("could not read camera state for '{}': {}", name, e),
        }
    }
}

/// Log level for a browser console message, or `None` to drop it.
/// Without forwarding every message is dropped.
pub fn console_level(msg: &ConsoleMessage, forward: bool) -> Option<Level> {
    if !forward {
        return None;
    }
    Some(match msg.level.as_str() {
        "error" | "pageerror" => Level::Error,
        "warn" | "warning" => Level::Warn,
        "debug" => Level::Debug,
        _ => Level::Info,
    })
}

/// The bundled viewer page as a self-contained `data:` URL
pub fn viewer_page_url(module_url: &str, css_url: &str) -> String {
    let html = VIEWER_TEMPLATE
        .replace("{{VIEWER_MODULE_URL}}", module_url)
        .replace("{{VIEWER_CSS_URL}}", css_url);
    let b64 = Base64Engine::encode(&base64::engine::general_purpose::STANDARD, html);
    format!("data:text/html;base64,{}", b64)
}

fn wait_for_enter(name: &str) -> Result<()> {
    print!("  {}: Press Enter to take screenshot...", name);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(level: &str, text: &str) -> ConsoleMessage {
        ConsoleMessage { level: level.to_string(), text: text.to_string() }
    }

    #[test]
    fn console_is_suppressed_without_forwarding() {
        for level in ["error", "pageerror", "warn", "info", "log", "debug"] {
            assert_eq!(console_level(&msg(level, "WebGL lost"), false), None);
        }
        assert_eq!(console_level(&msg("info", "Unknown option render_edges"), false), None);
    }

    #[test]
    fn forwarded_messages_keep_their_level() {
        assert_eq!(console_level(&msg("info", "Unknown option render_edges"), true), Some(Level::Info));
        assert_eq!(console_level(&msg("error", "WebGL lost"), true), Some(Level::Error));
        assert_eq!(console_level(&msg("pageerror", "x"), true), Some(Level::Error));
        assert_eq!(console_level(&msg("warn", "x"), true), Some(Level::Warn));
    }

    #[test]
    fn page_url_embeds_module_url() {
        let url = viewer_page_url("https://example.test/viewer.js", "https://example.test/viewer.css");
        let b64 = url.strip_prefix("data:text/html;base64,").expect("data url");
        let html = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        let html = String::from_utf8(html).unwrap();
        assert!(html.contains("https://example.test/viewer.js"));
        assert!(html.contains("https://example.test/viewer.css"));
        assert!(!html.contains("{{VIEWER_MODULE_URL}}"));
    }

    #[test]
    fn job_payload_groups_options() {
        let model = SerializedModel { name: "box".into(), document: json!({ "parts": [] }) };
        let job = RenderJob::new(model, RenderConfig::defaults(), Path::new("out"));
        assert_eq!(job.output_path, Path::new("out").join("box.png"));
        let payload = job.payload();
        assert_eq!(payload["config"]["display"]["cadWidth"], json!(1200));
        assert_eq!(payload["config"]["viewer"]["control"], json!("trackball"));
        assert_eq!(payload["name"], json!("box"));
    }
}

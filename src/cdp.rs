//! Chrome DevTools Protocol page (uses the `headless_chrome` crate)

use crate::viewer::{ConsoleMessage, ViewerPage};
use crate::{Error, Result};
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::warn;
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

const CONSOLE_BINDING: &str = "__tcv_console";

/// Chrome flags for software WebGL, so rendering works without a GPU
pub const SWIFTSHADER_ARGS: &[&str] = &[
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--use-gl=angle",
    "--use-angle=swiftshader",
    "--enable-webgl",
    "--ignore-gpu-blocklist",
    "--enable-unsafe-swiftshader",
];

/// How the browser is launched
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Window size; large enough for any viewer size a script asks for
    pub window_size: (u32, u32),
    /// Chrome binary; `None` lets `headless_chrome` find or fetch one
    pub chrome_path: Option<PathBuf>,
    pub args: Vec<String>,
    /// Browser is shut down after this long without CDP traffic
    pub idle_timeout: Duration,
    /// Default wait for tab operations such as navigation
    pub tab_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1920, 1440),
            chrome_path: None,
            args: SWIFTSHADER_ARGS.iter().map(|s| s.to_string()).collect(),
            idle_timeout: Duration::from_secs(600),
            tab_timeout: Duration::from_secs(30),
        }
    }
}

/// A single Chrome tab driven over CDP
pub struct CdpPage {
    browser: Browser,
    tab: Arc<Tab>,
    console: Arc<Mutex<Vec<ConsoleMessage>>>,
}

impl CdpPage {
    /// Launch Chrome, open a tab and hook its console
    pub fn launch(config: &BrowserConfig) -> Result<Self> {
        let args: Vec<&OsStr> = config.args.iter().map(OsStr::new).collect();
        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false)
            .window_size(Some(config.window_size))
            .path(config.chrome_path.clone())
            .idle_browser_timeout(config.idle_timeout)
            .args(args)
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;
        tab.set_default_timeout(config.tab_timeout);

        let mut page = Self { browser, tab, console: Arc::new(Mutex::new(Vec::new())) };
        page.hook_console();
        Ok(page)
    }

    /// Route `console.*` calls and uncaught errors into the console buffer.
    /// Must run before the viewer page is loaded.
    fn hook_console(&mut self) {
        let sink = self.console.clone();
        let _ = self
            .tab
            .expose_function(CONSOLE_BINDING, Arc::new(move |payload: Value| {
                // payload may be a JSON string
                let msg = match payload {
                    Value::String(s) => serde_json::from_str::<Value>(&s).unwrap_or(Value::String(s)),
                    other => other,
                };
                let level = msg.get("level").and_then(Value::as_str).unwrap_or("log").to_string();
                let text = match msg.get("args") {
                    Some(Value::Array(args)) => args
                        .iter()
                        .map(|v| v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()))
                        .collect::<Vec<_>>()
                        .join(" "),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                if let Ok(mut buf) = sink.lock() {
                    buf.push(ConsoleMessage { level, text });
                }
            }))
            .map_err(|e| warn!("Failed to expose console binding: {}", e))
            .ok();

        let wrapper = r#"(function(){
            const bind = window.__tcv_console;
            if (!bind) return;
            const post = function(level, args){
                try{ bind(JSON.stringify({ level: level, args: args.map(a => String(a)) })); }catch(e){}
            };
            ['log','info','warn','error','debug'].forEach(function(k){
                const orig = console[k];
                console[k] = function(...args){
                    post(k, args);
                    try{ orig.apply(console, args); }catch(e){}
                };
            });
            window.addEventListener('error', function(ev){ post('pageerror', [ev.message]); });
            window.addEventListener('unhandledrejection', function(ev){ post('pageerror', [ev.reason]); });
        })();"#;

        let _ = self
            .tab
            .call_method(Page::AddScriptToEvaluateOnNewDocument {
                source: wrapper.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })
            .map_err(|e| warn!("Failed to inject console wrapper: {}", e))
            .ok();
    }
}

impl ViewerPage for CdpPage {
    fn navigate(&mut self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .map_err(|e| Error::CdpError(format!("Navigation failed: {}", e)))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::CdpError(format!("Wait for navigation failed: {}", e)))?;
        Ok(())
    }

    fn evaluate(&mut self, expression: &str) -> Result<Value> {
        evaluate_on(&self.tab, expression)
    }

    fn evaluate_within(&mut self, expression: &str, timeout: Duration) -> Result<Value> {
        let (tx, rx) = mpsc::channel();
        let tab = Arc::clone(&self.tab);
        let expression = expression.to_string();
        std::thread::spawn(move || {
            let _ = tx.send(evaluate_on(&tab, &expression));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(Error::CdpError(format!("Evaluation did not finish within {} ms", timeout.as_millis()))),
        }
    }

    fn capture_element_png(&mut self, selector: &str, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let element = match self.tab.wait_for_element_with_custom_timeout(selector, timeout) {
            Ok(element) => element,
            Err(e) => {
                warn!("Element `{}` not found: {}", selector, e);
                return Ok(None);
            }
        };
        let png = element
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png)
            .map_err(|e| Error::CdpError(format!("Screenshot failed: {}", e)))?;
        Ok(Some(png))
    }

    fn drain_console(&mut self) -> Vec<ConsoleMessage> {
        match self.console.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        }
    }

    fn close(self) -> Result<()> {
        // Drop explicitly so the Chrome child process exits promptly
        drop(self.tab);
        drop(self.browser);
        Ok(())
    }
}

fn evaluate_on(tab: &Tab, expression: &str) -> Result<Value> {
    // Objects are not returned by value, so marshal everything as a JSON string
    let wrapped = format!("(async () => JSON.stringify(await ({})))()", expression);
    let result = tab
        .evaluate(&wrapped, true)
        .map_err(|e| Error::CdpError(format!("Evaluation failed: {}", e)))?;

    match result.value {
        Some(Value::String(s)) => serde_json::from_str(&s)
            .map_err(|e| Error::CdpError(format!("Evaluation returned malformed JSON: {}", e))),
        Some(other) => Ok(other),
        None => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_launch_uses_software_webgl() {
        let cfg = BrowserConfig::default();
        assert!(cfg.headless);
        assert!(cfg.args.iter().any(|a| a == "--use-angle=swiftshader"));
        assert!(cfg.window_size.0 >= 1200 && cfg.window_size.1 >= 800);
    }

    #[test]
    #[ignore]
    fn launches_chrome_and_evaluates() {
        // Requires Chrome
        let mut page = match CdpPage::launch(&BrowserConfig::default()) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Skipping: Chrome is not available: {}", e);
                return;
            }
        };
        page.navigate("data:text/html,<p id='x'>hi</p>").unwrap();
        assert_eq!(page.evaluate("Promise.resolve({ a: 1 })").unwrap(), serde_json::json!({ "a": 1 }));
        let stalled = page.evaluate_within("new Promise(() => {})", Duration::from_millis(200));
        assert!(matches!(stalled, Err(Error::CdpError(_))));
        page.evaluate("console.warn('Unknown option foo')").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let console = page.drain_console();
        assert!(console.iter().any(|m| m.level == "warn" && m.text.contains("Unknown option")));
        page.close().unwrap();
    }
}

//! tcv_screenshots
//!
//! Batch renderer for CAD example scripts: runs each script, collects the
//! models it registers, serializes them for three-cad-viewer and captures a
//! PNG per model from a headless browser.
//!
//! # Features
//!
//! - **CDP Backend** (default): drives the viewer in headless Chrome
//! - **Explicit registry**: models registered by one file never leak into the next
//! - **Bounded waits**: render completion is polled with a fixed timeout
//!
//! # Example
//!
//! ```no_run
//! use tcv_screenshots::{BatchCoordinator, BatchOptions, BridgeConfig, BrowserConfig, ScriptRunner, WorkSet};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = tcv_screenshots::launch_viewer(&BrowserConfig::default(), BridgeConfig::default())?;
//! let options = BatchOptions { output_folder: "shots".into(), ..Default::default() };
//! let mut batch = BatchCoordinator::new(ScriptRunner::default(), Some(bridge), options)?;
//! let summary = batch.run(&WorkSet::Directory("examples".into()))?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod batch;
pub mod capture;
pub mod config;
pub mod geometry;
pub mod registry;
pub mod script;
pub mod serializer;
pub mod viewer;

#[cfg(feature = "cdp")]
pub mod cdp;

pub use batch::{export_model, load_exported, BatchCoordinator, BatchOptions, BatchSummary, Failure, WorkSet};
pub use capture::CaptureMethod;
pub use config::{RenderConfig, ViewerOptions};
pub use registry::{ModelRegistry, SavedModel};
pub use script::{ScriptConfig, ScriptOutcome, ScriptRunner};
pub use serializer::{serialize, SerializedModel};
pub use viewer::{BridgeConfig, ConsoleMessage, RenderJob, RenderState, ViewerBridge, ViewerPage};

#[cfg(feature = "cdp")]
pub use cdp::{BrowserConfig, CdpPage};

/// Launch headless Chrome and open the viewer in it
#[cfg(feature = "cdp")]
pub fn launch_viewer(browser: &BrowserConfig, bridge: BridgeConfig) -> Result<ViewerBridge<CdpPage>> {
    let page = CdpPage::launch(browser)?;
    ViewerBridge::open(page, bridge)
}

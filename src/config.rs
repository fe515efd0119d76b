//! Viewer configuration: documented defaults, shallow merge and the split
//! into the option groups three-cad-viewer expects.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Keys passed to the viewer as display options
pub const DISPLAY_KEYS: &[&str] = &["cadWidth", "height", "treeWidth", "theme", "glass", "tools", "pinning", "keymap"];

/// Keys passed to the viewer as render options
pub const RENDER_KEYS: &[&str] = &[
    "ambientIntensity",
    "directIntensity",
    "metalness",
    "roughness",
    "edgeColor",
    "defaultOpacity",
    "normalLen",
];

/// Configuration for one render: option name to JSON value
///
/// A config is always the default set overridden by the keys a script passed
/// to `save_model` (shallow merge, user keys win).
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// let mut overrides = serde_json::Map::new();
/// overrides.insert("cadWidth".into(), json!(500));
/// let cfg = tcv_screenshots::RenderConfig::merged(&overrides);
/// assert_eq!(cfg.viewport(), (500, 800));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderConfig(Map<String, Value>);

/// A config partitioned into the three option groups of the viewer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewerOptions {
    pub display: Map<String, Value>,
    pub render: Map<String, Value>,
    pub viewer: Map<String, Value>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl RenderConfig {
    /// The documented defaults
    pub fn defaults() -> Self {
        let value = json!({
            // Display
            "cadWidth": 1200,
            "height": 800,
            "treeWidth": 0,
            "theme": "light",
            "glass": true,
            "tools": false,
            // Render
            "ambientIntensity": 1.0,
            "directIntensity": 1.1,
            "metalness": 0.3,
            "roughness": 0.65,
            "edgeColor": 0x707070,
            "defaultOpacity": 0.5,
            // Viewer
            "ortho": true,
            "control": "trackball",
            "up": "Z",
            "axes": false,
            "axes0": false,
            "grid": [false, false, false],
            "transparent": false,
            "blackEdges": false,
            "tab": "tree",
            "zoom": 1.0,
        });
        match value {
            Value::Object(map) => RenderConfig(map),
            _ => RenderConfig(Map::new()),
        }
    }

    /// Defaults overridden by `overrides`
    pub fn merged(overrides: &Map<String, Value>) -> Self {
        let mut cfg = Self::defaults();
        for (k, v) in overrides {
            cfg.0.insert(k.clone(), v.clone());
        }
        cfg
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Viewer size in CSS pixels, falling back to the defaults when the
    /// override is not a positive integer.
    pub fn viewport(&self) -> (u32, u32) {
        let dim = |key: &str, fallback: u32| {
            self.0
                .get(key)
                .and_then(Value::as_u64)
                .filter(|v| *v > 0 && *v <= u32::MAX as u64)
                .map(|v| v as u32)
                .unwrap_or(fallback)
        };
        (dim("cadWidth", 1200), dim("height", 800))
    }

    /// Partition into display/render/viewer options. Anything not known as a
    /// display or render option is handed to the viewer, which warns about
    /// keys it does not recognise.
    pub fn split(&self) -> ViewerOptions {
        let mut opts = ViewerOptions::default();
        for (k, v) in &self.0 {
            let group = if DISPLAY_KEYS.contains(&k.as_str()) {
                &mut opts.display
            } else if RENDER_KEYS.contains(&k.as_str()) {
                &mut opts.render
            } else {
                &mut opts.viewer
            };
            group.insert(k.clone(), v.clone());
        }
        opts
    }
}

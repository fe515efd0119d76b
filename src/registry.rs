//! Model registry: the models an example registered during one run

use crate::config::RenderConfig;
use serde_json::{Map, Value};

/// A model registered by an example script
#[derive(Debug, Clone, PartialEq)]
pub struct SavedModel {
    /// Unique name within the run; becomes the output file stem
    pub name: String,
    /// Geometry as copied out of the script at registration time
    pub model: Value,
    /// Defaults merged with the overrides given at registration
    pub config: RenderConfig,
}

/// Ordered store of [`SavedModel`]s.
///
/// The batch coordinator owns one registry and clears it before every example
/// file, so models registered by one file never show up in the next.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Vec<SavedModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a model. Fails if `name` is empty, is not a plain file stem,
    /// or is already registered.
    pub fn save_model(&mut self, model: Value, name: &str, config: Option<&Map<String, Value>>) -> std::result::Result<(), String> {
        check_name(name)?;
        if self.models.iter().any(|m| m.name == name) {
            return Err(format!("save_model: a model named '{}' was already saved", name));
        }
        let config = match config {
            Some(overrides) => RenderConfig::merged(overrides),
            None => RenderConfig::defaults(),
        };
        self.models.push(SavedModel { name: name.to_string(), model, config });
        Ok(())
    }

    /// Registered models in registration order; does not clear
    pub fn get_saved_models(&self) -> &[SavedModel] {
        &self.models
    }

    pub fn clear_saved_models(&mut self) {
        self.models.clear();
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Names become `<name>.png` and `<name>.json` inside the output folders, so
/// they must stay a single path component.
fn check_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("save_model: name must be a non-empty string".to_string());
    }
    let bad = name.contains(['/', '\\', '\0'])
        || name.contains("..")
        || std::path::Path::new(name).is_absolute();
    if bad {
        return Err(format!(
            "save_model: name '{}' must not contain path separators, '..' or NUL",
            name.escape_default()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_registration_order_and_does_not_clear_on_read() {
        let mut r = ModelRegistry::new();
        r.save_model(json!({"solid": "box"}), "b", None).unwrap();
        r.save_model(json!({"solid": "sphere"}), "a", None).unwrap();
        let names: Vec<_> = r.get_saved_models().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
        assert_eq!(r.len(), 2);
        r.clear_saved_models();
        assert!(r.is_empty());
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut r = ModelRegistry::new();
        r.save_model(json!({}), "step", None).unwrap();
        assert!(r.save_model(json!({}), "step", None).is_err());
        assert!(r.save_model(json!({}), "  ", None).is_err());
    }

    #[test]
    fn rejects_names_that_leave_the_output_folder() {
        let mut r = ModelRegistry::new();
        for name in ["/tmp/x", "../x", "a/b", "a\\b", "..", "nul\0byte", "C:\\x"] {
            assert!(r.save_model(json!({}), name, None).is_err(), "accepted {:?}", name);
        }
        assert!(r.is_empty());
        r.save_model(json!({}), "step-1_box.v2", None).unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn merges_config_at_save_time() {
        let mut r = ModelRegistry::new();
        let mut o = Map::new();
        o.insert("cadWidth".into(), json!(500));
        r.save_model(json!({}), "m", Some(&o)).unwrap();
        let cfg = &r.get_saved_models()[0].config;
        assert_eq!(cfg.viewport(), (500, 800));
        assert_eq!(cfg.get("theme"), Some(&json!("light")));
    }
}

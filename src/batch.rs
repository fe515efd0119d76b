//! Batch coordinator: example files in, screenshots (and debug JSON) out

use crate::config::RenderConfig;
use crate::registry::{ModelRegistry, SavedModel};
use crate::script::{ScriptOutcome, ScriptRunner, API_MODULE};
use crate::serializer::{self, SerializedModel};
use crate::viewer::{RenderJob, ViewerBridge, ViewerPage};
use crate::{Error, Result};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The files to process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkSet {
    File(PathBuf),
    /// Every `*.js` file directly inside the directory, except `_`-prefixed ones
    Directory(PathBuf),
    /// Every `*.json` model previously exported into the directory; rendered
    /// without running any script
    Models(PathBuf),
}

impl WorkSet {
    /// Expand into an ordered list of files
    pub fn resolve(&self) -> Result<Vec<PathBuf>> {
        match self {
            WorkSet::File(path) => {
                if !path.is_file() {
                    return Err(Error::ConfigError(format!("{} is not a file", path.display())));
                }
                Ok(vec![path.clone()])
            }
            WorkSet::Directory(dir) => list_dir(dir, "js"),
            WorkSet::Models(dir) => list_dir(dir, "json"),
        }
    }
}

fn list_dir(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::ConfigError(format!("{} is not a directory", dir.display())));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let wanted = path.extension().map_or(false, |ext| ext == extension)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| !n.starts_with('_'));
        if wanted && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Where results go and which stages run
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_folder: PathBuf,
    /// Write each serialized model as `<name>.json` here
    pub models_dir: Option<PathBuf>,
    /// Export only, never touch the browser
    pub skip_render: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { output_folder: PathBuf::from("."), models_dir: None, skip_render: false }
    }
}

/// One thing that went wrong during a batch
#[derive(Debug)]
pub struct Failure {
    pub file: PathBuf,
    /// `None` when the whole file failed
    pub model: Option<String>,
    pub error: Error,
}

/// Totals for a finished batch
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub models_rendered: usize,
    pub models_exported: usize,
    pub failures: Vec<Failure>,
    /// Screenshots written, in render order
    pub outputs: Vec<PathBuf>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Log and keep a failure. File-level errors are never tied to a model.
    pub fn record(&mut self, file: &Path, model: Option<&str>, error: Error) {
        let model = if error.is_file_level() { None } else { model.map(str::to_string) };
        match &model {
            Some(name) => error!("FAILURE {} [{}]: {}", file.display(), name, error),
            None => error!("FAILURE {}: {}", file.display(), error),
        }
        self.failures.push(Failure { file: file.to_path_buf(), model, error });
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Done: {} rendered, {} exported, {} failed ({} files processed, {} skipped)",
            self.models_rendered,
            self.models_exported,
            self.failures.len(),
            self.files_processed,
            self.files_skipped
        )?;
        for failure in &self.failures {
            let kind = failure.error.kind();
            match &failure.model {
                Some(model) => writeln!(f, "  FAILURE {} [{}] {}: {}", failure.file.display(), model, kind, failure.error)?,
                None => writeln!(f, "  FAILURE {} {}: {}", failure.file.display(), kind, failure.error)?,
            }
        }
        Ok(())
    }
}

/// Drives files through script execution, serialization and rendering.
///
/// Owns the one registry of the batch and the one viewer page. Files and
/// models are handled strictly in order; a failure is recorded and the batch
/// moves on.
pub struct BatchCoordinator<P: ViewerPage> {
    runner: ScriptRunner,
    registry: ModelRegistry,
    bridge: Option<ViewerBridge<P>>,
    options: BatchOptions,
    written: HashMap<String, PathBuf>,
}

impl<P: ViewerPage> BatchCoordinator<P> {
    /// `bridge` may only be `None` in export-only mode
    pub fn new(runner: ScriptRunner, bridge: Option<ViewerBridge<P>>, options: BatchOptions) -> Result<Self> {
        if options.skip_render && options.models_dir.is_none() {
            return Err(Error::ConfigError("skipping the render requires a models directory".into()));
        }
        if !options.skip_render && bridge.is_none() {
            return Err(Error::ConfigError("rendering requires a viewer".into()));
        }
        Ok(Self { runner, registry: ModelRegistry::new(), bridge, options, written: HashMap::new() })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Process every file of `work` and report what happened
    pub fn run(&mut self, work: &WorkSet) -> Result<BatchSummary> {
        let from_models = matches!(work, WorkSet::Models(_));
        if from_models && self.options.skip_render {
            return Err(Error::ConfigError("rendering exported models cannot skip the render".into()));
        }
        let files = work.resolve()?;
        info!("{} file(s) to process", files.len());
        let mut summary = BatchSummary::default();
        for file in &files {
            if from_models {
                self.process_exported(file, &mut summary);
            } else {
                self.process_file(file, &mut summary);
            }
        }
        Ok(summary)
    }

    /// Run one file and handle each model it registered
    pub fn process_file(&mut self, path: &Path, summary: &mut BatchSummary) {
        self.registry.clear_saved_models();
        info!("processing {}", path.display());

        let outcome = self.runner.run_file(path, &mut self.registry);
        self.registry.clear_saved_models();
        let models = match outcome {
            Ok(ScriptOutcome::Skipped) => {
                info!("skipped {} (does not require '{}')", path.display(), API_MODULE);
                summary.files_skipped += 1;
                return;
            }
            Ok(ScriptOutcome::Models(models)) => models,
            Err(e) => {
                summary.files_processed += 1;
                summary.record(path, None, e);
                return;
            }
        };
        summary.files_processed += 1;
        if models.is_empty() {
            warn!("{} registered no models", path.display());
        }

        for saved in &models {
            if let Err(e) = self.process_model(path, saved, summary) {
                summary.record(path, Some(&saved.name), e);
            }
        }
    }

    /// Render one model exported by an earlier run
    pub fn process_exported(&mut self, path: &Path, summary: &mut BatchSummary) {
        info!("rendering {}", path.display());
        summary.files_processed += 1;
        let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
        let result = load_exported(path).and_then(|(model, config)| self.render_model(path, model, config, summary));
        if let Err(e) = result {
            summary.record(path, Some(&name), e);
        }
    }

    /// Release the viewer page
    pub fn close(self) -> Result<()> {
        match self.bridge {
            Some(bridge) => bridge.close(),
            None => Ok(()),
        }
    }

    fn process_model(&mut self, path: &Path, saved: &SavedModel, summary: &mut BatchSummary) -> Result<()> {
        let serialized = serializer::serialize(&saved.name, &saved.model)?;

        if let Some(dir) = &self.options.models_dir {
            let out = export_model(dir, &serialized, &saved.config)?;
            info!("exported {}", out.display());
            summary.models_exported += 1;
        }
        if self.options.skip_render {
            return Ok(());
        }
        self.render_model(path, serialized, saved.config.clone(), summary)
    }

    fn render_model(&mut self, path: &Path, model: SerializedModel, config: RenderConfig, summary: &mut BatchSummary) -> Result<()> {
        if let Some(previous) = self.written.insert(model.name.clone(), path.to_path_buf()) {
            warn!(
                "'{}' from {} overwrites the screenshot written for {}",
                model.name,
                path.display(),
                previous.display()
            );
        }

        let bridge = self
            .bridge
            .as_mut()
            .ok_or_else(|| Error::ConfigError("rendering requires a viewer".into()))?;
        let job = RenderJob::new(model, config, &self.options.output_folder);
        let out = bridge.render(&job)?;
        info!("OK {}", out.display());
        summary.models_rendered += 1;
        summary.outputs.push(out);
        Ok(())
    }
}

/// Write `{model, config}` for `model` to `<dir>/<name>.json`
pub fn export_model(dir: &Path, model: &SerializedModel, config: &RenderConfig) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", model.name));
    let payload = json!({ "model": model.document, "config": config });
    let text = serde_json::to_string_pretty(&payload)
        .map_err(|e| Error::SerializationError { model: model.name.clone(), reason: e.to_string() })?;
    fs::write(&path, text)?;
    Ok(path)
}

/// Read a `{model, config}` file written by [`export_model`]. The model is
/// named after the file stem and the config is merged over the defaults.
pub fn load_exported(path: &Path) -> Result<(SerializedModel, RenderConfig)> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::ConfigError(format!("{} has no usable file name", path.display())))?
        .to_string();
    let fail = |reason: String| Error::SerializationError { model: name.clone(), reason };

    let text = fs::read_to_string(path)?;
    let mut payload: Value = serde_json::from_str(&text).map_err(|e| fail(e.to_string()))?;
    let document = match payload.get_mut("model").map(Value::take) {
        Some(doc @ Value::Object(_)) => doc,
        _ => return Err(fail("exported file has no `model` object".into())),
    };
    let config = match payload.get("config") {
        Some(Value::Object(overrides)) => RenderConfig::merged(overrides),
        None | Some(Value::Null) => RenderConfig::defaults(),
        Some(_) => return Err(fail("`config` must be an object".into())),
    };
    Ok((SerializedModel { name, document }, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewer::ConsoleMessage;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Export-only runs never reach the page
    struct NoPage;

    impl ViewerPage for NoPage {
        fn navigate(&mut self, _url: &str) -> Result<()> {
            Err(Error::Other("no page".into()))
        }
        fn evaluate(&mut self, _expression: &str) -> Result<Value> {
            Err(Error::Other("no page".into()))
        }
        fn capture_element_png(&mut self, _selector: &str, _timeout: Duration) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn drain_console(&mut self) -> Vec<ConsoleMessage> {
            Vec::new()
        }
        fn close(self) -> Result<()> {
            Ok(())
        }
    }

    const TWO_BOXES: &str = r#"
        const { save_model, get_saved_models } = require("tcv_screenshots");
        function main() {
            save_model({ solid: "box", size: [1, 2, 3] }, "tall", { cadWidth: 500 });
            save_model({ solid: "sphere", radius: 2 }, "ball");
            return get_saved_models();
        }
    "#;

    fn exporter(models: &Path) -> BatchCoordinator<NoPage> {
        let options = BatchOptions { output_folder: PathBuf::from("."), models_dir: Some(models.to_path_buf()), skip_render: true };
        BatchCoordinator::new(ScriptRunner::default(), None, options).unwrap()
    }

    #[test]
    fn directory_yields_sorted_js_files_without_private_ones() {
        let dir = tempdir().unwrap();
        for name in ["b.js", "a.js", "_helper.js", "notes.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested.js")).unwrap();
        let files = WorkSet::Directory(dir.path().to_path_buf()).resolve().unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, ["a.js", "b.js"]);
    }

    #[test]
    fn missing_inputs_are_config_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.js");
        assert!(matches!(WorkSet::File(missing.clone()).resolve(), Err(Error::ConfigError(_))));
        assert!(matches!(WorkSet::Directory(missing).resolve(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn export_only_writes_model_and_config() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("boxes.js");
        fs::write(&script, TWO_BOXES).unwrap();
        let models = dir.path().join("models");

        let mut batch = exporter(&models);
        let summary = batch.run(&WorkSet::File(script)).unwrap();
        assert!(summary.is_success(), "{}", summary);
        assert_eq!(summary.models_exported, 2);
        assert_eq!(summary.models_rendered, 0);
        assert!(batch.registry().is_empty());

        let tall: Value = serde_json::from_str(&fs::read_to_string(models.join("tall.json")).unwrap()).unwrap();
        assert_eq!(tall["config"]["cadWidth"], json!(500));
        assert_eq!(tall["config"]["height"], json!(800));
        assert_eq!(tall["model"]["name"], json!("tall"));
        assert!(models.join("ball.json").is_file());
    }

    #[test]
    fn file_failures_are_recorded_and_the_batch_continues() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("a_broken.js"),
            r#"const api = require("tcv_screenshots"); function main() { throw new Error("boom"); }"#,
        )
        .unwrap();
        fs::write(dir.path().join("b_boxes.js"), TWO_BOXES).unwrap();
        fs::write(dir.path().join("c_plain.js"), "function main() { return 1; }").unwrap();

        let mut batch = exporter(&dir.path().join("models"));
        let summary = batch.run(&WorkSet::Directory(dir.path().to_path_buf())).unwrap();
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.models_exported, 2);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].model.is_none());
        assert!(matches!(summary.failures[0].error, Error::ScriptExecutionError { .. }));
        let report = summary.to_string();
        assert!(report.contains("a_broken.js"));
        assert!(report.contains("ScriptExecutionError"), "{}", report);
    }

    #[test]
    fn file_level_failures_drop_the_model_name() {
        let mut summary = BatchSummary::default();
        let script_error = Error::ScriptExecutionError { path: PathBuf::from("a.js"), cause: "boom".into() };
        summary.record(Path::new("a.js"), Some("box"), script_error);
        let capture_error = Error::CaptureError { model: "box".into(), reason: "no canvas".into() };
        summary.record(Path::new("a.js"), Some("box"), capture_error);
        assert_eq!(summary.failures[0].model, None);
        assert_eq!(summary.failures[1].model.as_deref(), Some("box"));
        assert!(summary.to_string().contains("[box] CaptureError"), "{}", summary);
    }

    #[test]
    fn exported_files_load_back_with_merged_config() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("boxes.js");
        fs::write(&script, TWO_BOXES).unwrap();
        let models = dir.path().join("models");
        exporter(&models).run(&WorkSet::File(script)).unwrap();

        let (model, config) = load_exported(&models.join("tall.json")).unwrap();
        assert_eq!(model.name, "tall");
        assert_eq!(model.document["name"], json!("tall"));
        assert_eq!(config.get("cadWidth"), Some(&json!(500)));

        let broken = models.join("broken.json");
        fs::write(&broken, r#"{ "config": {} }"#).unwrap();
        assert!(matches!(load_exported(&broken), Err(Error::SerializationError { model, .. }) if model == "broken"));
    }

    #[test]
    fn rendering_exported_models_needs_a_render() {
        let dir = tempdir().unwrap();
        let mut batch = exporter(dir.path());
        let res = batch.run(&WorkSet::Models(dir.path().to_path_buf()));
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }

    #[test]
    fn rendering_without_a_viewer_is_rejected() {
        let res = BatchCoordinator::<NoPage>::new(ScriptRunner::default(), None, BatchOptions::default());
        assert!(matches!(res, Err(Error::ConfigError(_))));
        let options = BatchOptions { skip_render: true, ..BatchOptions::default() };
        let res = BatchCoordinator::<NoPage>::new(ScriptRunner::default(), None, options);
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }
}

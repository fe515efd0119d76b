use anyhow::Context as _;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tcv_screenshots::{
    BatchCoordinator, BatchOptions, BridgeConfig, BrowserConfig, CaptureMethod, CdpPage, ScriptRunner, WorkSet,
};

/// Render CAD example scripts to PNG screenshots with three-cad-viewer
#[derive(Parser, Debug)]
#[command(name = "tcv_screenshots", version, about)]
#[command(group(ArgGroup::new("input").required(true).args(["file", "directory", "skip_export"])))]
struct Cli {
    /// Example script to render
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Directory of example scripts (non-recursive)
    #[arg(short = 'd', long, requires = "output_folder")]
    directory: Option<PathBuf>,

    /// Where screenshots are written
    #[arg(short = 'o', long)]
    output_folder: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    no_headless: bool,

    /// Wait for Enter before each screenshot and print the camera state
    #[arg(long)]
    pause: bool,

    /// Write serialized models here and forward browser console output
    #[arg(long, value_name = "MODELS_DIR")]
    debug: Option<PathBuf>,

    /// Render timeout per model in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Only export models, do not start the browser
    #[arg(long, requires = "debug")]
    skip_render: bool,

    /// Render the models already exported to the debug folder without running scripts
    #[arg(long, requires = "debug", conflicts_with = "skip_render")]
    skip_export: bool,

    /// How the screenshot is taken
    #[arg(long, value_enum, default_value_t = CaptureMethod::Element)]
    capture: CaptureMethod,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    let work = match (&cli.file, &cli.directory, &cli.debug) {
        (Some(file), _, _) => WorkSet::File(file.clone()),
        (None, Some(dir), _) => WorkSet::Directory(dir.clone()),
        (None, None, Some(models)) if cli.skip_export => WorkSet::Models(models.clone()),
        _ => anyhow::bail!("one of --file, --directory or --skip-export is required"),
    };
    let options = BatchOptions {
        output_folder: cli.output_folder.clone().unwrap_or_else(|| PathBuf::from(".")),
        models_dir: if cli.skip_export { None } else { cli.debug.clone() },
        skip_render: cli.skip_render,
    };

    let bridge = if cli.skip_render {
        None
    } else {
        let browser = BrowserConfig { headless: !cli.no_headless, ..BrowserConfig::default() };
        let bridge = BridgeConfig {
            render_timeout_ms: cli.timeout_ms,
            capture: cli.capture,
            pause: cli.pause,
            forward_console: cli.debug.is_some(),
            ..BridgeConfig::default()
        };
        Some(tcv_screenshots::launch_viewer(&browser, bridge).context("failed to start the viewer")?)
    };

    let mut batch = BatchCoordinator::<CdpPage>::new(ScriptRunner::default(), bridge, options)?;
    let summary = batch.run(&work).context("failed to collect example files")?;
    batch.close()?;

    print!("\n{}", summary);
    Ok(summary.is_success())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug.is_some());

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn directory_requires_output_folder() {
        assert!(Cli::try_parse_from(["tcv_screenshots", "-d", "ex"]).is_err());
        assert!(Cli::try_parse_from(["tcv_screenshots", "-d", "ex", "-o", "out"]).is_ok());
    }

    #[test]
    fn file_and_directory_are_exclusive() {
        assert!(Cli::try_parse_from(["tcv_screenshots"]).is_err());
        assert!(Cli::try_parse_from(["tcv_screenshots", "-f", "a.js", "-d", "ex", "-o", "o"]).is_err());
    }

    #[test]
    fn skip_render_requires_debug() {
        assert!(Cli::try_parse_from(["tcv_screenshots", "-f", "a.js", "--skip-render"]).is_err());
        let cli = Cli::try_parse_from(["tcv_screenshots", "-f", "a.js", "--skip-render", "--debug", "m"]).unwrap();
        assert!(cli.skip_render);
        assert_eq!(cli.capture, CaptureMethod::Element);
        assert_eq!(cli.timeout_ms, 30_000);
    }

    #[test]
    fn skip_export_renders_from_the_debug_folder() {
        assert!(Cli::try_parse_from(["tcv_screenshots", "--skip-export"]).is_err());
        assert!(Cli::try_parse_from(["tcv_screenshots", "--skip-export", "--debug", "m", "-f", "a.js"]).is_err());
        assert!(Cli::try_parse_from(["tcv_screenshots", "--skip-export", "--debug", "m", "--skip-render"]).is_err());
        let cli = Cli::try_parse_from(["tcv_screenshots", "--skip-export", "--debug", "m", "-o", "shots"]).unwrap();
        assert!(cli.skip_export);
        assert_eq!(cli.debug, Some(PathBuf::from("m")));
    }

    #[test]
    fn capture_method_parses() {
        let cli = Cli::try_parse_from(["tcv_screenshots", "-f", "a.js", "--capture", "viewer-image"]).unwrap();
        assert_eq!(cli.capture, CaptureMethod::ViewerImage);
    }
}

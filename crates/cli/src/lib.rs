use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use doc_model::{Preferences, SignatureColor, SignatureSize};
use pdf_engine::{default_engine, Engine, LopdfEngine};
use serde::Serialize;
use sign_core::{
    default_output_name, fit_display_rect, map_tap_in_display, ComposeOptions, PdfPoint,
    SignaturePad, SigningSession, Size,
};
use std::ffi::OsString;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "signpdf")]
#[command(about = "Place a hand-drawn signature on PDF pages and export a signed copy")]
pub struct Cli {
    /// Page rasterizer. `auto` requires pdfium to sign and falls back to lopdf for `info`.
    #[arg(long, global = true, value_enum, env = "SIGNPDF_ENGINE", default_value_t = EngineChoice::Auto)]
    engine: EngineChoice,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineChoice {
    Auto,
    Pdfium,
    /// Vector paths only; text, images and shadings are dropped.
    Lopdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Inspect,
    Export,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print machine-readable PDF metadata.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Stamp a signature image onto one page (or every page) and write a signed copy.
    Sign(SignArgs),
    /// Render recorded strokes into a transparent signature PNG.
    Draw(DrawArgs),
    /// Show or update the saved signing preferences.
    Prefs {
        /// Signature width as a percentage of the page width.
        #[arg(long)]
        size: Option<SignatureSize>,
        #[arg(long)]
        color: Option<SignatureColor>,
        #[arg(long = "all-pages", value_name = "BOOL")]
        sign_all_pages: Option<bool>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Args)]
struct SignArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    /// Signature image (PNG with transparency).
    #[arg(long, value_name = "PNG")]
    signature: PathBuf,
    /// Signature centre in page points, origin at the top-left corner.
    #[arg(
        long,
        value_name = "X,Y",
        value_parser = parse_pair,
        allow_hyphen_values = true,
        conflicts_with = "tap",
        required_unless_present = "tap"
    )]
    at: Option<Pair>,
    /// Tap position on a display of `--viewport` size showing the page aspect-fit.
    #[arg(long, value_name = "X,Y", value_parser = parse_pair, requires = "viewport")]
    tap: Option<Pair>,
    #[arg(long, value_name = "W,H", value_parser = parse_pair)]
    viewport: Option<Pair>,
    /// 1-based page number [default: 1]. Implies `--all-pages=false`.
    #[arg(long)]
    page: Option<u32>,
    /// Place the same signature at the same anchor on every page.
    /// Overrides the saved preference; `--all-pages=false` turns it off.
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    all_pages: Option<bool>,
    #[arg(long)]
    size: Option<SignatureSize>,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DrawArgs {
    /// One stroke as space-separated `x,y` points. Repeat for several strokes.
    #[arg(long = "points", value_name = "POINTS", value_parser = parse_polyline, required = true)]
    strokes: Vec<Polyline>,
    #[arg(long, default_value_t = 600)]
    width: u32,
    #[arg(long, default_value_t = 200)]
    height: u32,
    #[arg(long)]
    color: Option<SignatureColor>,
    #[arg(long)]
    stroke_width: Option<f32>,
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct Polyline(Vec<(f32, f32)>);

#[derive(Debug, Serialize)]
struct InfoOutput {
    path: String,
    page_count: u32,
    first_page_size_pt: Option<PageSizeOutput>,
}

#[derive(Debug, Serialize)]
struct PageSizeOutput {
    width: f32,
    height: f32,
}

#[derive(Debug, Serialize)]
struct SignOutput {
    output: String,
    pages: u32,
    signed_pages: u32,
    signature_size: f32,
    renderer: &'static str,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_tracing();

    match cli.command {
        Commands::Info { file } => run_info(&file, cli.engine),
        Commands::Sign(args) => run_sign(args, cli.engine),
        Commands::Draw(args) => run_draw(args),
        Commands::Prefs { size, color, sign_all_pages } => run_prefs(size, color, sign_all_pages),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second call in the same process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn open_engine(choice: EngineChoice, purpose: Purpose) -> Result<Engine> {
    let engine = match choice {
        EngineChoice::Pdfium => default_engine().context("failed to load pdfium")?,
        EngineChoice::Lopdf => Engine::Lopdf(LopdfEngine::new()),
        EngineChoice::Auto => match default_engine() {
            Ok(engine) => engine,
            Err(err) if purpose == Purpose::Inspect => {
                tracing::warn!(error = %err, "pdfium unavailable, reading page geometry with lopdf");
                Engine::Lopdf(LopdfEngine::new())
            }
            Err(err) => {
                return Err(anyhow!(err).context(
                    "refusing to sign without pdfium; install it (or point \
                     PDFIUM_DYNAMIC_LIB_PATH at it) or pass `--engine lopdf` to keep vector paths only",
                ))
            }
        },
    };

    if purpose == Purpose::Export && !engine.is_full_fidelity() {
        tracing::warn!(
            renderer = engine.name(),
            "signing with the lopdf engine: text, images and shadings will not be preserved"
        );
    }

    Ok(engine)
}

/// Whether to stamp every page: an explicit `--all-pages` wins, an explicit
/// `--page` means one page, otherwise the saved preference applies.
fn resolve_all_pages(all_pages: Option<bool>, page: Option<u32>, saved: bool) -> Result<bool> {
    match (all_pages, page) {
        (Some(true), Some(page)) => {
            anyhow::bail!("--page {page} cannot be combined with --all-pages")
        }
        (Some(all_pages), _) => Ok(all_pages),
        (None, Some(_)) => Ok(false),
        (None, None) => Ok(saved),
    }
}

fn run_info(file: &Path, engine: EngineChoice) -> Result<()> {
    ensure_pdf_exists(file)?;

    let engine = open_engine(engine, Purpose::Inspect)?;
    let session = SigningSession::open(engine, file).context("failed to open PDF")?;

    let page_count = session.page_count();
    let first_page_size_pt = if page_count > 0 {
        let size = session.page_size(0)?;
        Some(PageSizeOutput { width: size.width_pt, height: size.height_pt })
    } else {
        None
    };

    let payload = InfoOutput { path: file.display().to_string(), page_count, first_page_size_pt };

    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");

    session.close()?;

    Ok(())
}

fn run_sign(args: SignArgs, engine: EngineChoice) -> Result<()> {
    ensure_pdf_exists(&args.file)?;

    let page = args.page.unwrap_or(1);
    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }

    let preferences = load_preferences()?;
    let size = args.size.unwrap_or(preferences.signature_size);
    let all_pages = resolve_all_pages(args.all_pages, args.page, preferences.sign_all_pages)?;

    let signature = image::open(&args.signature)
        .with_context(|| format!("failed to read signature image {}", args.signature.display()))?
        .to_rgba8();

    let engine = open_engine(engine, Purpose::Export)?;
    let renderer = engine.name();
    let mut session =
        SigningSession::open(engine, args.file.as_path()).context("failed to open PDF")?;

    let page_count = session.page_count();
    if page > page_count {
        anyhow::bail!("--page {page} is out of range, document has {page_count} pages");
    }
    let page_index = page - 1;

    let anchor = match (args.at, args.tap, args.viewport) {
        (Some(at), _, _) => PdfPoint::new(at.x, at.y),
        (None, Some(tap), Some(viewport)) => {
            let page = Size::from(session.page_size(page_index)?);
            let display = fit_display_rect(Size::new(viewport.x, viewport.y), page);
            map_tap_in_display(tap.x, tap.y, display, page).ok_or_else(|| {
                anyhow!("tap {},{} falls outside the displayed page", tap.x, tap.y)
            })?
        }
        _ => anyhow::bail!("either --at or --tap with --viewport is required"),
    };

    let signature = Arc::new(signature);
    if all_pages {
        session.place_on_all_pages(signature, anchor)?;
    } else {
        session.place(page_index, signature, anchor)?;
    }

    let output = args.output.unwrap_or_else(|| default_output_name(&args.file));
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let report = session
        .export_to_path(&output, &ComposeOptions::with_size(size))
        .with_context(|| format!("failed to export signed PDF to {}", output.display()))?;

    session.close()?;

    let payload = SignOutput {
        output: output.display().to_string(),
        pages: report.pages,
        signed_pages: report.signed_pages,
        signature_size: size.percent(),
        renderer,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);

    Ok(())
}

fn run_draw(args: DrawArgs) -> Result<()> {
    let preferences = load_preferences()?;

    let mut pad = SignaturePad::new(args.width, args.height);
    pad.set_color(args.color.unwrap_or(preferences.signature_color));
    if let Some(width) = args.stroke_width {
        pad.set_stroke_width(width);
    }

    for Polyline(points) in &args.strokes {
        pad.draw_polyline(points);
    }

    let image = pad.export().context("failed to export signature")?;

    if let Some(parent) = args.output.parent() {
        fs::create_dir_all(parent)?;
    }

    image
        .save(&args.output)
        .with_context(|| format!("failed to write image to {}", args.output.display()))?;

    println!("{}", args.output.display());

    Ok(())
}

fn run_prefs(
    size: Option<SignatureSize>,
    color: Option<SignatureColor>,
    sign_all_pages: Option<bool>,
) -> Result<()> {
    let storage = Storage::from_env_or_default().context("failed to locate preferences")?;
    let mut preferences = storage.load_preferences().context("failed to load preferences")?;

    let before = preferences;
    if let Some(size) = size {
        preferences.signature_size = size;
    }
    if let Some(color) = color {
        preferences.signature_color = color;
    }
    if let Some(sign_all_pages) = sign_all_pages {
        preferences.sign_all_pages = sign_all_pages;
    }

    if preferences != before {
        storage.save_preferences(&preferences).context("failed to save preferences")?;
    }

    println!("{}", serde_json::to_string_pretty(&preferences)?);

    Ok(())
}

fn load_preferences() -> Result<Preferences> {
    let storage = Storage::from_env_or_default().context("failed to locate preferences")?;
    storage.load_preferences().context("failed to load preferences")
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn parse_pair(raw: &str) -> Result<Pair, String> {
    let (x, y) = raw.split_once(',').ok_or_else(|| format!("expected `X,Y`, got `{raw}`"))?;

    Ok(Pair { x: parse_coordinate(x)?, y: parse_coordinate(y)? })
}

fn parse_coordinate(raw: &str) -> Result<f32, String> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| format!("`{}` is not a finite number", raw.trim()))
}

fn parse_polyline(raw: &str) -> Result<Polyline, String> {
    raw.split_whitespace()
        .map(|point| parse_pair(point).map(|pair| (pair.x, pair.y)))
        .collect::<Result<Vec<_>, _>>()
        .map(Polyline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_accept_whitespace_and_negatives() {
        assert_eq!(parse_pair("297.5, 421").expect("valid"), Pair { x: 297.5, y: 421.0 });
        assert_eq!(parse_pair("-10,5").expect("valid"), Pair { x: -10.0, y: 5.0 });
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_pair("12").is_err());
        assert!(parse_pair("a,b").is_err());
        assert!(parse_pair("1,inf").is_err());
    }

    #[test]
    fn polyline_parses_every_point() {
        let line = parse_polyline("0,0 10,5  20,10").expect("valid");
        assert_eq!(line, Polyline(vec![(0.0, 0.0), (10.0, 5.0), (20.0, 10.0)]));
        assert!(parse_polyline("0,0 nope").is_err());
    }

    #[test]
    fn explicit_all_pages_overrides_saved_preference() {
        assert!(!resolve_all_pages(Some(false), None, true).expect("valid"));
        assert!(resolve_all_pages(Some(true), None, false).expect("valid"));
        assert!(resolve_all_pages(None, None, true).expect("valid"));
    }

    #[test]
    fn explicit_page_turns_off_saved_all_pages() {
        assert!(!resolve_all_pages(None, Some(2), true).expect("valid"));
        assert!(!resolve_all_pages(Some(false), Some(2), true).expect("valid"));
        assert!(resolve_all_pages(Some(true), Some(2), false).is_err());
    }

    #[test]
    fn all_pages_flag_parses_with_and_without_value() {
        let parse = |extra: &[&str]| {
            let mut args = vec!["signpdf", "sign", "a.pdf", "--signature", "s.png", "--at", "1,1"];
            args.extend_from_slice(extra);
            match Cli::try_parse_from(args).expect("should parse").command {
                Commands::Sign(sign) => sign.all_pages,
                other => panic!("unexpected command: {other:?}"),
            }
        };

        assert_eq!(parse(&[]), None);
        assert_eq!(parse(&["--all-pages"]), Some(true));
        assert_eq!(parse(&["--all-pages=false"]), Some(false));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

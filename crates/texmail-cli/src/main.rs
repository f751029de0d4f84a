use std::future::Future;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use texmail_core::{
    Activation, CommandTypesetter, ComposeSession, ComposeSurface, ImageSource, LatexEditor,
    MathRenderer, MathSpanExtractor, MemoryCompose, MemoryOptions, RenderConfig, RenderReport,
};

mod config;

#[derive(Parser)]
#[command(version, about = "texmail - render LaTeX in mail bodies as inline images", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the KDL config file
    #[arg(long, global = true, env = "TEXMAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace every math span in an HTML body with a rendered image
    Render {
        #[command(flatten)]
        io: Io,

        #[command(flatten)]
        images: ImageArgs,
    },
    /// Replace every math span with inline MathML
    Mathml {
        #[command(flatten)]
        io: Io,
    },
    /// List the math spans found in a body
    Extract {
        /// Input HTML file, `-` for stdin
        input: Option<PathBuf>,

        /// Print the spans as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a rendered equation and render the body again
    Edit {
        #[command(flatten)]
        io: Io,

        #[command(flatten)]
        images: ImageArgs,

        /// Index of the image in the body, counting from 0
        #[arg(long)]
        image: usize,

        /// Replacement LaTeX; prompts on stdin when missing
        #[arg(long)]
        latex: Option<String>,
    },
    /// Turn every rendered equation back into delimited LaTeX
    Restore {
        #[command(flatten)]
        io: Io,
    },
}

#[derive(Args)]
struct Io {
    /// Input HTML file, `-` for stdin
    input: Option<PathBuf>,

    /// Output file; stdout when missing
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ImageArgs {
    /// Write images to this directory instead of embedding data URIs
    #[arg(long)]
    assets: Option<PathBuf>,

    /// Prefix for image links when using --assets; defaults to the directory path
    #[arg(long, requires = "assets")]
    href_prefix: Option<String>,

    /// Raster scale factor
    #[arg(long)]
    scale: Option<f32>,

    /// LaTeX to SVG command
    #[arg(long, env = "TEXMAIL_TYPESETTER")]
    typesetter: Option<String>,

    /// How long to wait for uploads, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_miette();

    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Render { io, images } => {
            let body = read_input(io.input.as_deref())?;
            let session = session(body, &images, config).await?;
            let report = session.render().await?;
            print_report(&report);
            write_output(io.output.as_deref(), &session.surface().body())?;
        }
        Commands::Mathml { io } => {
            let body = read_input(io.input.as_deref())?;
            let session = ComposeSession::new(MemoryCompose::new(body), renderer(&config), config);
            let out = session.render_mathml().await?;
            for (raw, message) in &out.failed {
                eprintln!("⚠ {raw}: {message}");
            }
            eprintln!("✓ Rendered {} equation(s) as MathML", out.rendered);
            write_output(io.output.as_deref(), &session.surface().body())?;
        }
        Commands::Extract { input, json } => {
            let body = read_input(input.as_deref())?;
            let spans = MathSpanExtractor::new(&config.delimiters).extract(&body);
            if json {
                let json = serde_json::to_string_pretty(&spans).into_diagnostic()?;
                println!("{json}");
            } else {
                for span in &spans {
                    let mode = if span.display { "display" } else { "inline" };
                    println!("{}\t{mode}\t{}", span.sequence_index, span.latex);
                }
            }
        }
        Commands::Edit {
            io,
            images,
            image,
            latex,
        } => {
            let reading_stdin = io.input.as_deref().is_none_or(|p| p == Path::new("-"));
            if latex.is_none() && reading_stdin {
                return Err(miette::miette!(
                    "stdin carries the body; pass the replacement with --latex"
                ));
            }
            let body = read_input(io.input.as_deref())?;
            let session = session(body, &images, config).await?;
            match session.activate(image, &PromptEditor { answer: latex }).await? {
                Activation::NotGenerated => {
                    return Err(miette::miette!("image {image} is not a rendered equation"));
                }
                Activation::Cancelled => eprintln!("Edit cancelled"),
                Activation::Edited(report) => print_report(&report),
            }
            write_output(io.output.as_deref(), &session.surface().body())?;
        }
        Commands::Restore { io } => {
            let body = read_input(io.input.as_deref())?;
            let (body, restored) = texmail_core::round_trip::restore_all(&body, &config.marker_class);
            eprintln!("✓ Restored {restored} equation(s)");
            write_output(io.output.as_deref(), &body)?;
        }
    }

    Ok(())
}

async fn session(
    body: String,
    images: &ImageArgs,
    mut config: RenderConfig,
) -> Result<ComposeSession<MemoryCompose, CommandTypesetter>> {
    if let Some(scale) = images.scale {
        config.scale = scale;
    }
    if let Some(program) = &images.typesetter {
        config.typesetter.program = program.clone();
    }
    if let Some(ms) = images.timeout_ms {
        config.upload_timeout = Duration::from_millis(ms);
    }

    let source = match &images.assets {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await.into_diagnostic()?;
            let href_prefix = images
                .href_prefix
                .clone()
                .unwrap_or_else(|| format!("{}/", dir.display()));
            ImageSource::Directory {
                dir: dir.clone(),
                href_prefix,
            }
        }
        None => ImageSource::DataUri,
    };
    let surface = MemoryCompose::with_options(
        body,
        MemoryOptions {
            source,
            ..Default::default()
        },
    );

    Ok(ComposeSession::new(surface, renderer(&config), config))
}

fn renderer(config: &RenderConfig) -> Arc<MathRenderer<CommandTypesetter>> {
    Arc::new(MathRenderer::new(
        CommandTypesetter::new(config.typesetter.clone()),
        config,
    ))
}

fn print_report(report: &RenderReport) {
    for failure in &report.failed {
        eprintln!("⚠ {} left as text: {}", failure.raw_match, failure.error);
    }
    for warning in &report.warnings {
        eprintln!("⚠ {warning}");
    }
    eprintln!(
        "✓ Rendered {} of {} equation(s)",
        report.finalized,
        report.equations + report.failed.len()
    );
}

/// Reads the replacement LaTeX from stdin unless one was given up front.
struct PromptEditor {
    answer: Option<String>,
}

impl LatexEditor for PromptEditor {
    fn edit(&self, latex: &str) -> impl Future<Output = Option<String>> + Send {
        let answer = self.answer.clone();
        let current = latex.to_string();
        async move {
            if answer.is_some() {
                return answer;
            }
            eprintln!("Current LaTeX: {current}");
            eprint!("New LaTeX (empty to cancel): ");
            let _ = std::io::stderr().flush();
            let line = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().lock().read_line(&mut line).map(|_| line)
            })
            .await
            .ok()?
            .ok()?;
            let line = line.trim();
            (!line.is_empty()).then(|| line.to_string())
        }
    }
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .into_diagnostic()
            .map_err(|e| e.wrap_err(format!("failed to read {}", path.display()))),
        _ => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .into_diagnostic()?;
            Ok(body)
        }
    }
}

fn write_output(path: Option<&Path>, body: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, body).into_diagnostic()?;
            eprintln!("✓ Output: {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(body.as_bytes()).into_diagnostic()?;
            stdout.flush().into_diagnostic()?;
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn init_miette() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(2)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .expect("couldn't set the miette hook");
    miette::set_panic_hook();
}

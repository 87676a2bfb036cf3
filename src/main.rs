use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jitter::config::{self, Config};
use jitter::confirm::TerminalSurface;
use jitter::generate::{ImplementationGenerator, OpenRouterGenerator};
use jitter::inspect::{describe, FunctionDescriptor};
use jitter::patch::{Durability, PatchOutcome};
use jitter::runtime::Runtime;
use jitter::scan::PlaceholderScanner;
use jitter::script::OutputSink;
use jitter::workflow::{Orchestrator, Settings, WorkflowReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "jitter",
    about = "Implement placeholder functions the moment they are first called",
    version
)]
struct Args {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script, implementing placeholders as they are hit
    Run {
        file: PathBuf,

        /// Function to call after the top level has run
        #[arg(short, long)]
        entry: Option<String>,

        /// Rewrite the source file instead of patching the running program
        #[arg(long, conflicts_with = "both")]
        durable: bool,

        /// Rewrite the source file and patch the running program
        #[arg(long)]
        both: bool,

        /// Skip the generator and always write implementations by hand
        #[arg(long)]
        no_ai: bool,
    },
    /// Print what a generator would be told about a function
    Inspect {
        file: PathBuf,

        /// Qualified name, e.g. `Shape.area`
        function: String,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List placeholder functions under a directory
    Scan {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Store the OpenRouter API key in the system keychain
    Setup,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Run {
            file,
            entry,
            durable,
            both,
            no_ai,
        } => {
            let durability = match (durable, both) {
                (_, true) => Some(Durability::Both),
                (true, false) => Some(Durability::Durable),
                _ => None,
            };
            run(&file, entry.as_deref(), durability, no_ai)
        }
        Command::Inspect { file, function, json } => inspect(&file, &function, json),
        Command::Scan { dir } => scan(&dir),
        Command::Setup => {
            config::setup_api_key_interactive().map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "jitter=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("JITTER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(file: &Path, entry: Option<&str>, durability: Option<Durability>, no_ai: bool) -> Result<()> {
    let mut config = Config::load();
    if no_ai {
        config.use_generator = false;
    }
    let mut settings = Settings::from_config(&config);
    if let Some(durability) = durability {
        settings = settings.with_durability(durability);
    }

    let mut orchestrator = Orchestrator::new(Arc::new(TerminalSurface::new()), settings);
    if config.use_generator {
        match OpenRouterGenerator::from_config(&mut config) {
            Some(generator) => {
                tracing::debug!(model = generator.model(), "generator ready");
                let generator: Arc<dyn ImplementationGenerator> = Arc::new(generator);
                orchestrator = orchestrator.with_generator(generator);
            }
            None => eprintln!("  No OpenRouter key found; run `jitter setup` to enable suggestions."),
        }
    }

    let mut runtime = Runtime::new(Arc::new(orchestrator), OutputSink::Stdout);
    let result = runtime
        .run_guarded(file)
        .with_context(|| format!("running {}", file.display()))
        .and_then(|module| match entry {
            Some(name) => {
                let callee = runtime
                    .lookup(&module, name)
                    .with_context(|| format!("resolving entry point `{}`", name))?;
                runtime
                    .call_guarded(&callee, Vec::new())
                    .map(|_| ())
                    .with_context(|| format!("calling `{}`", name))
            }
            None => Ok(()),
        });

    print_summary(&runtime.history());
    result
}

fn print_summary(history: &[WorkflowReport]) {
    if history.is_empty() {
        return;
    }
    eprintln!();
    for report in history {
        let outcome = match &report.outcome {
            PatchOutcome::Applied { durability, .. } => format!("applied ({})", durability),
            PatchOutcome::Rejected { original, candidate } => {
                format!("rejected ({} vs {} parameters)", original, candidate)
            }
            PatchOutcome::Declined => "declined".to_string(),
        };
        eprintln!("  {:<40} {}", report.target, outcome);
    }
}

fn inspect(file: &Path, function: &str, json: bool) -> Result<()> {
    let surface = Arc::new(TerminalSurface::new());
    let mut runtime = Runtime::new(
        Arc::new(Orchestrator::new(surface, Settings::default())),
        OutputSink::Stdout,
    );
    let module = runtime
        .interpreter()
        .load_file(file, false)
        .with_context(|| format!("loading {}", file.display()))?;
    let value = runtime.lookup(&module, function)?;
    let descriptor = describe(&value)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
    } else {
        print_descriptor(&descriptor);
    }
    Ok(())
}

fn print_descriptor(descriptor: &FunctionDescriptor) {
    println!("{}", descriptor.qualname);
    println!("  location:  {}", descriptor.location);
    println!("  signature: {}", descriptor.signature);
    if descriptor.is_method {
        println!("  kind:      method");
    }
    for decorator in &descriptor.decorators {
        println!("  decorator: @{}", decorator);
    }
    if let Some(doc) = &descriptor.docstring {
        println!("  docstring: {}", doc.lines().next().unwrap_or_default());
    }
    for arg in &descriptor.arguments {
        match &arg.declared_type {
            Some(ty) => println!("  arg {}: {}", arg.name, ty),
            None => println!("  arg {}", arg.name),
        }
    }
    for info in descriptor.custom_types() {
        println!();
        match &info.source {
            Some(source) => {
                println!("  {} ({})", info.name, source.location);
                for line in &source.lines {
                    print!("    {}", line);
                }
            }
            None => println!("  {} (definition not available)", info.name),
        }
    }
    println!();
    for (i, line) in descriptor.source.iter().enumerate() {
        print!("  {:>4} | {}", descriptor.location.start_line + i, line);
    }
}

fn scan(dir: &Path) -> Result<()> {
    let found = PlaceholderScanner::new().scan(dir);
    if found.is_empty() {
        eprintln!("  No placeholder functions under {}", dir.display());
        return Ok(());
    }
    for placeholder in &found {
        println!("{}", placeholder);
    }
    eprintln!("  {} placeholder function(s)", found.len());
    Ok(())
}

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use protodomain::fuzz::DataMutator;
use protodomain::{parse, Fuzz, MutatorMode, Session, SessionConfig};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// One hex line per message.
    Hex,
    /// Messages written back to back as bytes.
    Raw,
}

/// Generate messages of a symbol described in a grammar file.
#[derive(Debug, Parser)]
#[command(name = "specialize")]
struct Args {
    /// Grammar file describing the symbols.
    grammar: PathBuf,
    /// Symbol to generate.
    symbol: String,
    /// Number of messages.
    #[arg(short = 'n', long, default_value = "1")]
    count: usize,
    /// Seed for reproducible output.
    #[arg(long)]
    seed: Option<u64>,
    /// Fuzz the named field (repeatable).
    #[arg(long = "fuzz", value_name = "FIELD")]
    fuzz: Vec<String>,
    #[arg(long, value_enum, default_value = "hex")]
    format: Format,
    /// Bound for fields without a maximum length, in bytes.
    #[arg(long, default_value = "64")]
    max_bytes: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let src = std::fs::read_to_string(&args.grammar)
        .with_context(|| format!("reading grammar {}", args.grammar.display()))?;
    let symbols = parse(&src).with_context(|| format!("parsing grammar {}", args.grammar.display()))?;
    let Some(symbol) = symbols.iter().find(|s| s.name() == args.symbol) else {
        let known: Vec<&str> = symbols.iter().map(|s| s.name()).collect();
        bail!("unknown symbol {} (grammar defines: {})", args.symbol, known.join(", "));
    };

    let mut config = SessionConfig::default().with_max_generated_bytes(args.max_bytes);
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    let mut session = Session::new(config);
    if !args.fuzz.is_empty() {
        let mut fuzz = Fuzz::new();
        for (i, name) in args.fuzz.iter().enumerate() {
            let field = symbol
                .field(name)
                .with_context(|| format!("symbol {} has no field {}", symbol.name(), name))?;
            let seed = args.seed.unwrap_or(0).wrapping_add(i as u64);
            fuzz.set(field.domain(), DataMutator::seeded(MutatorMode::Generate, seed));
        }
        session.set_fuzz(fuzz);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for _ in 0..args.count {
        let message = session.specialize(symbol).with_context(|| format!("specializing {}", symbol.name()))?;
        match args.format {
            Format::Hex => writeln!(out, "{}", hex::encode(message.to_bytes()))?,
            Format::Raw => out.write_all(&message.to_bytes())?,
        }
    }
    out.flush()?;
    Ok(())
}

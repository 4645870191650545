//! convrec CLI - train and inspect the conversational recommender.
//!
//! # Usage
//!
//! ```bash
//! # Write the synthetic corpus to disk and inspect it
//! convrec generate --out data/toy
//! convrec stats --data data/toy
//!
//! # Validate a configuration file
//! convrec check-config config.json
//!
//! # Run all stages, or a single one
//! convrec train --data data/toy --config config.json
//! convrec train --data data/toy --stage rec
//!
//! # Everything end to end on the synthetic corpus
//! convrec demo --epochs 2
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use convrec_core::{Dataset, SyntheticConfig, TruncationConfig};
use convrec_nn::KgsfConfig;
use convrec_system::{KgsfSystem, PolicyTrainer, Stage, StandardEvaluator, SystemConfig};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "convrec")]
#[command(about = "Knowledge-graph conversational recommender", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show statistics about a dataset directory
    Stats {
        /// Dataset directory
        #[arg(long)]
        data: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a configuration file
    CheckConfig {
        /// Configuration file (JSON)
        config: PathBuf,
    },

    /// Write the synthetic corpus as a dataset directory
    Generate {
        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Number of conversations
        #[arg(long, default_value = "30")]
        conversations: usize,

        /// Random seed
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Train on a dataset directory
    Train {
        /// Dataset directory
        #[arg(long)]
        data: PathBuf,

        /// Configuration file (JSON). Defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// all, pretrain, rec or conv
        #[arg(long, default_value = "all")]
        stage: String,

        /// Also train the topic policy model
        #[arg(long)]
        policy: bool,
    },

    /// Run every stage on the synthetic corpus with a small model
    Demo {
        /// Epochs per stage
        #[arg(long, default_value = "1")]
        epochs: usize,

        /// Number of conversations
        #[arg(long, default_value = "30")]
        conversations: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Stats { data, json } => cmd_stats(&data, json),
        Commands::CheckConfig { config } => cmd_check_config(&config),
        Commands::Generate {
            out,
            conversations,
            seed,
        } => cmd_generate(&out, conversations, seed),
        Commands::Train {
            data,
            config,
            stage,
            policy,
        } => cmd_train(&data, config.as_deref(), &stage, policy),
        Commands::Demo {
            epochs,
            conversations,
        } => cmd_demo(epochs, conversations),
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));
    let data = Dataset::load(path)
        .with_context(|| format!("Failed to load dataset from {}", path.display()))?;
    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
    Ok(data)
}

fn load_config(path: Option<&Path>) -> Result<SystemConfig> {
    match path {
        Some(p) => SystemConfig::from_json_file(p)
            .with_context(|| format!("Failed to read config {}", p.display())),
        None => Ok(SystemConfig::default()),
    }
}

/// `all` or one stage tag.
fn parse_stages(tag: &str) -> Result<Vec<Stage>> {
    if tag.eq_ignore_ascii_case("all") {
        return Ok(Stage::ALL.to_vec());
    }
    let stage: Stage = tag.parse()?;
    Ok(vec![stage])
}

fn cmd_stats(data: &Path, json: bool) -> Result<()> {
    let stats = load_dataset(data)?.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Dataset Statistics");
    println!("==================");
    println!("Train records:  {}", stats.train);
    println!("Valid records:  {}", stats.valid);
    println!("Test records:   {}", stats.test);
    println!("Vocab size:     {}", stats.vocab_size);
    println!("Entities:       {}", stats.n_entity);
    println!("Words:          {}", stats.n_word);
    println!("Relations:      {}", stats.n_relation);
    println!("Entity edges:   {}", stats.entity_edges);
    println!("Word edges:     {}", stats.word_edges);
    println!("Items:          {}", stats.items);
    println!("Rec examples:   {}", stats.rec_examples);
    println!("Avg turns:      {:.2}", stats.avg_context_turns);
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_generate(out: &Path, conversations: usize, seed: u64) -> Result<()> {
    if conversations < 3 {
        bail!("need at least 3 conversations to fill train, valid and test");
    }
    let corpus = SyntheticConfig::default()
        .with_conversations(conversations)
        .with_seed(seed)
        .generate()?;
    corpus
        .write_to(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!(
        "Wrote {} train / {} valid / {} test records to {}",
        corpus.train.len(),
        corpus.valid.len(),
        corpus.test.len(),
        out.display()
    );
    Ok(())
}

fn run(config: SystemConfig, data: &Dataset, stages: &[Stage], policy: bool) -> Result<()> {
    let start = Instant::now();
    let mut system = KgsfSystem::new(config.clone(), data, StandardEvaluator::new())?;
    for &stage in stages {
        let summary = system
            .run_stage(stage)
            .with_context(|| format!("Stage {stage} failed"))?;
        let early = if summary.stopped_early { " (early stop)" } else { "" };
        println!("{stage}: {} epochs{early}", summary.epochs);
        if !summary.report.is_empty() {
            println!("  {}", summary.report);
        }
    }
    if policy {
        let mut trainer = PolicyTrainer::new(config, data, StandardEvaluator::new())?;
        let report = trainer.fit().context("Policy training failed")?;
        println!("policy: {report}");
    }
    println!("Done in {:.2?}", start.elapsed());
    Ok(())
}

fn cmd_train(data: &Path, config: Option<&Path>, stage: &str, policy: bool) -> Result<()> {
    let stages = parse_stages(stage)?;
    let config = load_config(config)?;
    let data = load_dataset(data)?;
    run(config, &data, &stages, policy)
}

fn demo_config(epochs: usize) -> SystemConfig {
    let mut config = SystemConfig::default()
        .with_model(
            KgsfConfig::default()
                .with_token_emb_dim(16)
                .with_kg_emb_dim(16)
                .with_num_bases(2)
                .with_heads(2)
                .with_layers(1)
                .with_ffn_size(16)
                .with_response_truncate(8),
        )
        .with_truncation(
            TruncationConfig::default()
                .with_context(32)
                .with_response(8)
                .with_entity(8)
                .with_word(16),
        )
        .with_epochs(epochs, epochs, epochs)
        .with_batch_size(8);
    config.policy.epoch = epochs;
    config
}

fn cmd_demo(epochs: usize, conversations: usize) -> Result<()> {
    if conversations < 3 {
        bail!("need at least 3 conversations to fill train, valid and test");
    }
    let data = SyntheticConfig::default()
        .with_conversations(conversations)
        .generate()?
        .into_dataset()?;
    println!(
        "Synthetic corpus: {} train / {} valid / {} test records",
        data.train.len(),
        data.valid.len(),
        data.test.len()
    );
    run(demo_config(epochs), &data, &Stage::ALL, true)
}

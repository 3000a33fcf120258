use anyhow::Result;
use clap::{Parser, Subcommand};
use layerwise::{
    config::{DaConfig, RbmConfig, RunConfig, StackedDaConfig},
    dataset::{synthetic_normal, train_valid_test_split},
    learn::{layer::Block, pretrain},
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerwise")]
#[command(about = "Unsupervised layerwise pretraining on synthetic data")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Rows of synthetic data.
    #[arg(long, default_value = "1000", global = true)]
    rows: usize,
    /// Columns of synthetic data, used when the model does not set its inputs.
    #[arg(long, default_value = "15", global = true)]
    cols: usize,
    /// Seed of the synthetic data.
    #[arg(long, default_value = "999", global = true)]
    data_seed: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Train a denoising autoencoder.
    Da {
        /// JSON configuration.
        #[arg(short, long)]
        config: PathBuf,
        /// Fraction of the rows held out for validation.
        #[arg(long, default_value = "0.1")]
        valid_ratio: f32,
        /// Fraction of the rows held out for testing.
        #[arg(long, default_value = "0.1")]
        test_ratio: f32,
    },
    /// Pretrain a stack of denoising autoencoders, one layer at a time.
    Sda {
        /// JSON configuration.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Train a restricted Boltzmann machine with persistent contrastive divergence.
    Rbm {
        /// JSON configuration.
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn columns(configured: usize, default: usize) -> usize {
    if configured == 0 {
        default
    } else {
        configured
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    match &cli.command {
        Command::Da {
            config,
            valid_ratio,
            test_ratio,
        } => {
            let conf = RunConfig::<DaConfig>::from_path(config)?;
            let cols = columns(conf.model.n_vis, cli.cols);
            let data = synthetic_normal(cli.rows, cols, cli.data_seed);
            let (train, valid, test) = train_valid_test_split(data.view(), *valid_ratio, *test_ratio);
            let (da, report) = pretrain::train_da(&conf, train, valid, test)?;
            let transformed = da.encode(data.view())?;
            tracing::info!(
                train_cost = report.train_cost,
                error_valid = ?report.error_valid,
                error_test = ?report.error_test,
                mean_activation = transformed.mean().unwrap_or_default(),
                "Done"
            );
        }
        Command::Sda { config } => {
            let conf = RunConfig::<StackedDaConfig>::from_path(config)?;
            let cols = columns(conf.model.n_vis, cli.cols);
            let data = synthetic_normal(cli.rows, cols, cli.data_seed);
            let (sda, summaries) = pretrain::train_sda(&conf, data.view())?;
            let transformed = sda.encode(data.view())?;
            for (layer, summary) in summaries.iter().enumerate() {
                tracing::info!(layer, cost = summary.train().mean_cost(), "Pretrained layer");
            }
            tracing::info!(output = ?transformed.dim(), "Done");
        }
        Command::Rbm { config } => {
            let conf = RunConfig::<RbmConfig>::from_path(config)?;
            let cols = columns(conf.model.nvis, cli.cols);
            let data = synthetic_normal(cli.rows, cols, cli.data_seed);
            let (_, report) = pretrain::train_rbm(&conf, data.view())?;
            tracing::info!(
                avg_rec_error = ?report.reconstruction_errors.last(),
                avg_nll = ?report.nlls.last().map(|(_, nll)| *nll),
                "Done"
            );
        }
    }
    Ok(())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ddpm_rs::{data::TensorDataset, trainer::DdpmBuilder};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, the built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long, global = true)]
    tracing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the denoising UNet on a folder of images.
    Train {
        /// Directory holding the training images.
        #[arg(long)]
        data: PathBuf,

        /// Weights to resume from.
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Generate an image with trained weights.
    Sample {
        #[arg(long)]
        weights: PathBuf,

        #[arg(long, default_value = "./ddpm_sample.png")]
        output: PathBuf,

        /// Also save the intermediate denoising frames side by side.
        #[arg(long)]
        plot: Option<PathBuf>,

        #[arg(long)]
        seed: Option<i64>,
    },
}

fn run(args: Args) -> anyhow::Result<()> {
    let builder = match &args.config {
        Some(path) => DdpmBuilder::from_file(path)?,
        None => DdpmBuilder::new(Default::default()),
    };
    info!(device = ?builder.device(), "using device");

    match args.command {
        Command::Train { data, resume } => {
            let cfg = builder.config();
            let mut dataset = TensorDataset::from_image_folder(&data, cfg.train.img_size, cfg.train.batch_size)?
                .to_device(builder.device());
            builder.check_dataset(&dataset)?;
            let model = builder.build_model()?;
            let mut optimizer = builder.build_optimizer(&model)?;
            let mut trainer = builder.build_trainer(model)?;
            if let Some(resume) = resume {
                trainer.load_model(resume)?;
            }
            let summaries = trainer.fit(&mut dataset, &mut optimizer)?;
            if let Some(last) = summaries.last() {
                info!(epoch = last.epoch, mean_loss = last.mean_loss, "training finished");
            }
        }
        Command::Sample { weights, output, plot, seed } => {
            if let Some(seed) = seed.or(builder.config().train.seed) {
                tch::manual_seed(seed);
            }
            let model = builder.build_model()?;
            let mut trainer = builder.build_trainer(model)?;
            trainer.load_model(&weights)?;
            trainer.generate_image(&output)?;
            info!(?output, "image saved");
            if let Some(plot) = plot {
                trainer.generate_image_plot(&plot, trainer.config().num_plot_images)?;
                info!(?plot, "plot saved");
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let _guard = if args.tracing {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(filter).with(fmt_layer).with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
        None
    };

    run(args)
}

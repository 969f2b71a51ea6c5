// ============================================================
// Layer 1 - CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction; parses arguments with
// clap and routes to the application layer. Three commands:
//   1. `train`   - run or resume a training run
//   2. `caption` - caption one image from the latest checkpoint
//   3. `stats`   - per-channel mean/std of an image directory

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{CaptionArgs, Commands, StatsArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "image-captioner",
    version = "0.1.0",
    about = "Train a CNN+LSTM captioning model on an image/caption index, then caption images."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => Self::run_train(args),
            Commands::Caption(args) => Self::run_caption(args),
            Commands::Stats(args) => Self::run_stats(args),
        }
    }

    fn run_train(args: TrainArgs) -> Result<()> {
        use crate::application::train_use_case::TrainUseCase;

        tracing::info!("starting training run '{}'", args.run_name);
        let use_case = TrainUseCase::new(args.into());
        use_case.execute()?;

        println!("Training complete. Checkpoint saved.");
        Ok(())
    }

    fn run_caption(args: CaptionArgs) -> Result<()> {
        use crate::application::caption_use_case::CaptionUseCase;

        let use_case = CaptionUseCase::new(args.checkpoint_dir.clone(), args.max_len);
        let caption = use_case.execute(&args.image)?;
        println!("\nCaption: {}", caption);
        Ok(())
    }

    fn run_stats(args: StatsArgs) -> Result<()> {
        use crate::data::images::channel_stats;

        let (mean, std) = channel_stats(&args.image_dir, (args.resize, args.resize))?;
        println!("mean: [{:.4}, {:.4}, {:.4}]", mean[0], mean[1], mean[2]);
        println!("std:  [{:.4}, {:.4}, {:.4}]", std[0], std[1], std[2]);
        Ok(())
    }
}

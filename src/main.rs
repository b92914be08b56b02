use afinar::cli::{self, commands::*};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "afinar",
    version,
    about = "LoRA fine-tuning pipeline: train, merge, convert, test",
    long_about = "afinar drives the full adapter fine-tuning pipeline: supervised LoRA \
                  training over a frozen base model, merging the adapter into standalone \
                  weights, converting the merged model to a quantized GGUF file, and \
                  manually testing the result with a prompt."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Use JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a LoRA adapter on a CSV dataset
    Train(TrainCommand),

    /// Merge a trained adapter into the base model
    Merge(MergeCommand),

    /// Convert a merged model to a quantized GGUF file
    Convert(ConvertCommand),

    /// Send a prompt to a trained artifact
    Test(TestCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = cli::logging::init_logging(cli.verbose, cli.quiet, cli.json) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Train(cmd) => cli::commands::train::execute(cmd).await,
        Commands::Merge(cmd) => cli::commands::merge::execute(cmd).await,
        Commands::Convert(cmd) => cli::commands::convert::execute(cmd).await,
        Commands::Test(cmd) => cli::commands::test::execute(cmd).await,
    };

    if let Err(err) = result {
        err.print_error();
        std::process::exit(1);
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duet::backend::BackendKind;
use duet::cli::{self, Decoding, PromptSource};
use duet::config::HarnessConfig;
use duet::models::DevicePreference;

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Compare a LoRA fine-tuned code model against its base model", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every command; each overrides the config file
#[derive(Args)]
struct GlobalArgs {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend: candle, subprocess, or mock
    #[arg(long, global = true)]
    backend: Option<BackendKind>,

    /// Base model name or HuggingFace model ID
    #[arg(long, global = true)]
    model: Option<String>,

    /// LoRA adapter directory for the fine-tuned variant
    #[arg(long, global = true)]
    adapter: Option<PathBuf>,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long, global = true)]
    device: Option<DevicePreference>,

    /// Weight dtype: f32, f16, or bf16
    #[arg(long, global = true)]
    dtype: Option<String>,

    /// Generation program for the subprocess backend
    #[arg(long, global = true)]
    program: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Sampler seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Stop generating at this text (repeatable)
    #[arg(long = "stop", global = true)]
    stop: Vec<String>,

    /// Run comparison slots one after the other
    #[arg(long, global = true)]
    sequential: bool,
}

impl GlobalArgs {
    fn into_config(self) -> anyhow::Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None => HarnessConfig::default(),
        };

        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(model) = self.model {
            config.model_id = model;
        }
        if let Some(adapter) = self.adapter {
            config.adapter = adapter;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = dtype;
        }
        if let Some(program) = self.program {
            config.program = program;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if !self.stop.is_empty() {
            config.stop_sequences = self.stop;
        }
        if self.sequential {
            config.parallel_compare = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
struct PromptArgs {
    /// Prompt text, or `-` to read stdin
    #[arg(short, long)]
    prompt: Option<String>,

    /// Built-in example prompt, by name or number
    #[arg(short, long)]
    example: Option<String>,

    /// Read the prompt from a file
    #[arg(short, long)]
    file: Option<PathBuf>,
}

impl From<PromptArgs> for PromptSource {
    fn from(args: PromptArgs) -> Self {
        Self {
            text: args.prompt,
            example: args.example,
            file: args.file,
        }
    }
}

#[derive(Args)]
struct DecodingArgs {
    /// Maximum new tokens (1-1000)
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature (0 = greedy, up to 2)
    #[arg(short, long)]
    temperature: Option<f32>,
}

impl From<DecodingArgs> for Decoding {
    fn from(args: DecodingArgs) -> Self {
        Self {
            max_tokens: args.max_tokens,
            temperature: args.temperature,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate with one model variant
    Generate {
        #[command(flatten)]
        prompt: PromptArgs,

        /// Variant: base or fine-tuned
        #[arg(short, long, default_value = "fine-tuned")]
        variant: String,

        #[command(flatten)]
        decoding: DecodingArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate with both variants side by side
    Compare {
        #[command(flatten)]
        prompt: PromptArgs,

        #[command(flatten)]
        decoding: DecodingArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every built-in prompt and tally the outcomes
    Suite {
        /// Compare both variants instead of probing the fine-tuned one
        #[arg(long)]
        compare: bool,

        #[command(flatten)]
        decoding: DecodingArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve JSON-lines requests on stdin, responses on stdout
    Session,

    /// List the built-in example prompts, or print one
    Prompts {
        /// Name or number of the prompt to print
        name: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results only
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    cli::block_on(run(cli), cli::SHUTDOWN_GRACE)?
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Prompts { name } => {
            cli::prompts(name)?;
        }

        Commands::Config => {
            cli::show_config(&cli.global.into_config()?)?;
        }

        Commands::Generate {
            prompt,
            variant,
            decoding,
            json,
        } => {
            let config = cli.global.into_config()?;
            cli::generate(config, prompt.into(), variant, decoding.into(), json).await?;
        }

        Commands::Compare {
            prompt,
            decoding,
            json,
        } => {
            let config = cli.global.into_config()?;
            cli::compare(config, prompt.into(), decoding.into(), json).await?;
        }

        Commands::Suite {
            compare,
            decoding,
            json,
        } => {
            let config = cli.global.into_config()?;
            cli::suite(config, compare, decoding.into(), json).await?;
        }

        Commands::Session => {
            let config = cli.global.into_config()?;
            cli::session(config).await?;
        }
    }

    Ok(())
}

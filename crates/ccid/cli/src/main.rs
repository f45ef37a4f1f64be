//! ccidadm: offline inspection of smart card reader negotiation

use clap::{Args, Parser, Subcommand, ValueEnum};
use nexum_ccid_core::{Protocols, ReaderCapabilities, ReaderConfig, ReaderFeatures};

mod commands;
mod display;

use commands::*;

#[derive(Parser)]
#[command(version, about = "Inspect ATRs, PPS exchanges and reader parameters offline")]
struct Cli {
    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an ATR
    Atr {
        /// ATR bytes as hex
        #[arg(required = true)]
        atr: String,
    },

    /// Show how a reader would bring the card into operation
    Plan {
        /// ATR bytes as hex
        #[arg(required = true)]
        atr: String,

        #[command(flatten)]
        reader: ReaderArgs,
    },

    /// Run parameter negotiation against a simulated card
    Negotiate {
        /// ATR bytes as hex
        #[arg(required = true)]
        atr: String,

        /// How the simulated card answers the PPS request
        #[arg(long, value_enum, default_value_t = PpsAnswer::Echo)]
        pps_answer: PpsAnswer,

        #[command(flatten)]
        reader: ReaderArgs,
    },

    /// Decode a PPS request or response
    Pps {
        /// PPS bytes as hex
        #[arg(required = true)]
        pps: String,
    },

    /// Decode a T=1 block
    Block {
        /// Block bytes as hex
        #[arg(required = true)]
        block: String,
    },

    /// Decode a reader reply message
    Reply {
        /// Message bytes as hex
        #[arg(required = true)]
        message: String,
    },
}

/// Reader protocol support
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProtocolArg {
    T0,
    T1,
    Both,
}

/// Reader exchange level
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LevelArg {
    Character,
    Tpdu,
    ShortApdu,
    ExtendedApdu,
}

/// Simulated PPS behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum PpsAnswer {
    /// Accept the request as sent
    Echo,
    /// Keep the default Fi/Di
    Decline,
    /// Answer PPS1 with the default Fi/Di
    Defaults,
}

/// Capabilities of the reader to model
#[derive(Args, Debug, Clone)]
struct ReaderArgs {
    /// Protocols the reader supports
    #[arg(long, value_enum, default_value_t = ProtocolArg::Both)]
    protocols: ProtocolArg,

    /// Exchange level of the reader
    #[arg(long, value_enum, default_value_t = LevelArg::Tpdu)]
    level: LevelArg,

    /// The reader applies Fi/Di itself
    #[arg(long)]
    auto_baud: bool,

    /// The reader performs PPS itself
    #[arg(long)]
    auto_pps: bool,

    /// The reader negotiates all parameters itself
    #[arg(long)]
    auto_params: bool,

    /// Prefer T=0 when the card offers both protocols
    #[arg(long)]
    prefer_t0: bool,
}

impl ReaderArgs {
    fn capabilities(&self) -> ReaderCapabilities {
        let protocols = match self.protocols {
            ProtocolArg::T0 => Protocols::T0,
            ProtocolArg::T1 => Protocols::T1,
            ProtocolArg::Both => Protocols::ALL,
        };
        let mut features = match self.level {
            LevelArg::Character => ReaderFeatures::NONE,
            LevelArg::Tpdu => ReaderFeatures::TPDU,
            LevelArg::ShortApdu => ReaderFeatures::SHORT_APDU,
            LevelArg::ExtendedApdu => ReaderFeatures::EXTENDED_APDU,
        };
        for (set, flag) in [
            (self.auto_baud, ReaderFeatures::AUTO_BAUD),
            (self.auto_pps, ReaderFeatures::AUTO_PPS),
            (self.auto_params, ReaderFeatures::AUTO_PARAM_NEG),
        ] {
            if set {
                features = features | flag;
            }
        }
        ReaderCapabilities::default()
            .with_protocols(protocols)
            .with_features(features)
    }

    fn config(&self) -> ReaderConfig {
        ReaderConfig::default().with_prefer_t1(!self.prefer_t0)
    }
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match &cli.command {
        Commands::Atr { atr } => atr_command(atr)?,
        Commands::Plan { atr, reader } => {
            plan_command(atr, &reader.capabilities(), &reader.config())?
        }
        Commands::Negotiate {
            atr,
            pps_answer,
            reader,
        } => negotiate_command(atr, *pps_answer, &reader.capabilities(), &reader.config())?,
        Commands::Pps { pps } => pps_command(pps)?,
        Commands::Block { block } => block_command(block)?,
        Commands::Reply { message } => reply_command(message)?,
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}

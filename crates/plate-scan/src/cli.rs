use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::aggregate::MergePolicy;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum MergePolicyArg {
    Concat,
    StarDelimited,
}

impl MergePolicyArg {
    pub fn into_policy(self) -> MergePolicy {
        match self {
            MergePolicyArg::Concat => MergePolicy::Concat,
            MergePolicyArg::StarDelimited => MergePolicy::StarDelimited,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "plate-scan",
    about = "Recognize license plates from captured images",
    disable_help_subcommand = true
)]
pub struct CliArgs {
    /// Override the configuration file path
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Minimum confidence a token must exceed to be kept
    #[arg(long = "threshold")]
    pub threshold: Option<f32>,

    /// How kept tokens are joined into the plate string
    #[arg(long = "merge-policy", value_enum)]
    pub merge_policy: Option<MergePolicyArg>,

    /// Recognition model: local path, file:// or http(s):// URL
    #[arg(long = "model", value_name = "URI")]
    pub model: Option<String>,

    /// Recognition dictionary file, one entry per line
    #[arg(long = "alphabet", value_name = "FILE")]
    pub alphabet: Option<PathBuf>,

    /// Engine invocation timeout in milliseconds (0 disables)
    #[arg(long = "engine-timeout-ms", value_name = "MS")]
    pub engine_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read one image from stdin and print the recognized plate
    Recognize {
        /// Append |<elapsed>ms to the printed plate
        #[arg(long)]
        timing: bool,
    },
    /// Serve the recognition HTTP API
    Serve {
        /// Socket address to bind
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Watch the capture stream and notify the parking gate
    Watch {
        /// Capture backend to pull frames from
        #[arg(long = "capture-backend", value_name = "NAME")]
        capture_backend: Option<String>,

        /// Directory the camera process drops encoded frames into
        #[arg(long = "spool-dir", value_name = "DIR")]
        spool_dir: Option<PathBuf>,

        /// Parking gate endpoint receiving the recognized plate
        #[arg(long = "gate-endpoint", value_name = "URL")]
        gate_endpoint: Option<String>,

        /// RFID tag forwarded with each gate notification
        #[arg(long)]
        rfid: Option<String>,
    },
}

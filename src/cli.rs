use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::billing::SubscriptionTier;
use crate::downloads::DownloadKind;
use crate::jobs::ResultType;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "YouTube content downloader client")]
pub struct Cli {
    /// Backend base URL (overrides YCD_API_URL and hostname detection)
    #[arg(long, global = true, env = "YCD_API_URL")]
    pub api_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in and remember the session
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long, env = "YCD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long, env = "YCD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the saved session
    Logout,
    /// Show plan and usage
    Status {
        /// Ask the backend to roll usage counters over first
        #[arg(long)]
        sync: bool,
    },
    /// Keep polling subscription status and print changes
    Watch,
    /// Download a transcript, audio or video
    Download {
        kind: MediaArg,
        /// YouTube URL or 11-character video id
        video: String,
        /// Cleaned transcript (timestamps and filler removed)
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        quality: Option<String>,
        /// Directory to save into
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Print the result location without saving
        #[arg(long)]
        no_save: bool,
    },
    /// Submit and track batch jobs
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },
    /// Upgrade, manage or cancel the subscription
    Billing {
        #[command(subcommand)]
        command: BillingCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BatchCommand {
    /// Submit videos from a CSV/text file or the command line
    Submit {
        #[arg(short = 't', long = "type", value_enum)]
        result_type: MediaArg,
        /// CSV or text file with links or ids
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Links or ids
        videos: Vec<String>,
        #[arg(long)]
        clean: bool,
        /// Return after submitting instead of following progress
        #[arg(long)]
        no_wait: bool,
    },
    /// Follow the saved batch until it finishes
    Status,
    /// Forget the saved batch
    Clear,
}

#[derive(Subcommand, Debug, Clone)]
pub enum BillingCommand {
    /// Print a checkout link for a paid plan
    Checkout {
        #[arg(value_enum)]
        tier: PlanArg,
    },
    /// Print a billing portal link
    Portal,
    /// Cancel at the end of the current period
    Cancel,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaArg {
    Transcript,
    Audio,
    Video,
}

impl From<MediaArg> for DownloadKind {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Transcript => Self::Transcript,
            MediaArg::Audio => Self::Audio,
            MediaArg::Video => Self::Video,
        }
    }
}

impl From<MediaArg> for ResultType {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Transcript => Self::Transcript,
            MediaArg::Audio => Self::Audio,
            MediaArg::Video => Self::Video,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanArg {
    Pro,
    Premium,
}

impl From<PlanArg> for SubscriptionTier {
    fn from(arg: PlanArg) -> Self {
        match arg {
            PlanArg::Pro => Self::Pro,
            PlanArg::Premium => Self::Premium,
        }
    }
}

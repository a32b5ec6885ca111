use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use chat_api::RecipientClass;

use crate::config::ConfigArgs;

/// Command line client for the conversation service.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List conversations.
    Conversations,
    /// Print the messages of a conversation.
    Messages { conversation: String },
    /// Send a text message.
    Send { conversation: String, text: String },
    /// Follow the conversation list, and optionally one conversation, until Ctrl+C.
    Watch { conversation: Option<String> },
    /// Count the recipients a broadcast filter selects.
    Resolve(ResolveArgs),
    /// Download an audio object, showing progress.
    FetchAudio {
        url: String,
        /// Declared duration in seconds, used to estimate progress.
        #[arg(long, default_value_t = 0)]
        duration: u32,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct ResolveArgs {
    #[arg(long, value_enum)]
    pub class: Option<ClassArg>,
    #[arg(long)]
    pub region: Vec<String>,
    #[arg(long)]
    pub city: Vec<String>,
    #[arg(long)]
    pub grade: Vec<String>,
    #[arg(long)]
    pub school: Vec<String>,
    #[arg(long)]
    pub branch: Vec<String>,
    #[arg(long)]
    pub language: Vec<String>,
    #[arg(long)]
    pub schedule: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassArg {
    Student,
    Teacher,
}

impl From<ClassArg> for RecipientClass {
    fn from(class: ClassArg) -> Self {
        match class {
            ClassArg::Student => RecipientClass::Student,
            ClassArg::Teacher => RecipientClass::Teacher,
        }
    }
}

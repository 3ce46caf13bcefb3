//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CompileCommand, HistoryCommand, NamesCommand, PublishCommand, SelfDeployCommand, StageCommand,
    TriggerCommand, ValidateCommand,
};
use std::ffi::OsString;

/// Self-updating deployment pipelines on a shared workflow engine
#[derive(Debug, Parser, Clone)]
#[command(name = "shipgraph")]
#[command(author = "shipgraph contributors")]
#[command(version)]
#[command(about = "Compiles pipeline descriptions into workflow graphs and republishes them safely", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a description and the environment it deploys to
    Validate(ValidateCommand),

    /// Compile a description into a workflow template
    Compile(CompileCommand),

    /// Compile and publish the graph
    Publish(PublishCommand),

    /// Run the self-deploy stage
    SelfDeploy(SelfDeployCommand),

    /// Show an instance's resource names
    Names(NamesCommand),

    /// Match a webhook payload against the target branch
    Trigger(TriggerCommand),

    /// Run a stage adapter
    Stage(StageCommand),

    /// Show publish history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

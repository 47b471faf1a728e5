use clap::{Args, Parser, Subcommand};

/// Operator tool for plenum.
///
/// Submits jobs to the worker pool, polls their tickets, registers datasets
/// and lists the workers currently checked into the registry.
#[derive(Parser, Debug)]
#[command(name = "plenum", version, about = "Operator tool for the plenum job queue")]
pub struct CliArgs {
    /// Configuration profile; keys resolve `<PROFILE>_<KEY>` before `<KEY>`
    #[arg(long, global = true, env = "PLENUM_PROFILE")]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a job and print its ticket
    Submit {
        /// Endpoint name, e.g. `update_dataset`
        endpoint: String,

        /// Query parameter, repeatable: `-q dataset_name=chicago_crimes`
        #[arg(short = 'q', long = "query", value_parser = parse_key_val)]
        query: Vec<(String, String)>,

        /// Poll the ticket until it finishes and print the result
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "300", requires = "wait")]
        wait_timeout: u64,
    },

    /// Show a ticket's status, request and result
    Status {
        ticket: String,
    },

    /// Register a dataset in the master index without ingesting it
    Register(RegisterArgs),

    /// List workers checked into the registry
    Workers,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Human-readable dataset name; the table name is derived from it
    #[arg(long)]
    pub name: String,

    /// Source URL or local path of the CSV
    #[arg(long)]
    pub url: String,

    /// Column holding the observation date
    #[arg(long)]
    pub observed_date: Option<String>,

    #[arg(long)]
    pub latitude: Option<String>,

    #[arg(long)]
    pub longitude: Option<String>,

    /// Column holding a combined "(lat, lon)" location
    #[arg(long)]
    pub location: Option<String>,

    /// Column that identifies a record across snapshots
    #[arg(long)]
    pub business_key: Option<String>,

    /// yearly, monthly, weekly or daily
    #[arg(long)]
    pub update_freq: Option<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

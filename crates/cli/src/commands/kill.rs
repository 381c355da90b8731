// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `muster kill` — stop running commands.
//!
//! After killing, there is a delay before the commands realise they have
//! been killed and stop; at that point they become buried and can be
//! removed.

use crate::client::ManagerClient;
use crate::error::CliError;
use crate::output;
use clap::Args;
use muster_core::Essence;
use muster_wire::{parse_essence_file, Request, Response};
use std::io::BufReader;
use std::time::Duration;

#[derive(Args)]
pub struct KillArgs {
    /// Kill all running jobs
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Identifier of the commands you want to kill
    #[arg(short = 'i', long = "identifier")]
    pub identifier: Option<String>,

    /// A command line you want to kill
    #[arg(short = 'l', long = "cmdline")]
    pub cmdline: Option<String>,

    /// File containing commands you want to kill; - means read from STDIN.
    /// Format: cmd<TAB>cwd<TAB>mountsJSON, last two columns optional
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Working dir that the command(s) specified by -l or -f were set to
    /// run in
    #[arg(short = 'c', long = "cwd")]
    pub cwd: Option<String>,

    /// Mounts JSON that the command(s) specified by -l or -f were set to
    /// use
    #[arg(long)]
    pub mounts: Option<String>,

    /// How long (seconds) to wait to get a reply from the manager
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,
}

impl KillArgs {
    fn selector_count(&self) -> usize {
        [
            self.all,
            self.identifier.is_some(),
            self.cmdline.is_some(),
            self.file.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Build the request without touching the network. Selector validation
/// happens here.
fn build_request(args: &KillArgs) -> anyhow::Result<Request> {
    match args.selector_count() {
        0 => {
            return Err(CliError::Usage("1 of -f, -i, -l or -a is required".to_string()).into())
        }
        1 => {}
        _ => {
            return Err(CliError::Usage(
                "-f, -i, -l and -a are mutually exclusive; only specify one of them".to_string(),
            )
            .into())
        }
    }

    if args.all {
        return Ok(Request::KillAll);
    }
    if let Some(identifier) = &args.identifier {
        return Ok(Request::KillGroup { identifier: identifier.clone() });
    }

    let mounts = args
        .mounts
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .map_err(|e| CliError::BadInput(format!("bad --mounts JSON: {}", e)))?;

    let essences = if let Some(cmdline) = &args.cmdline {
        let mut essence = Essence::new(cmdline.clone());
        if let Some(cwd) = &args.cwd {
            essence = essence.with_cwd(cwd.clone());
        }
        if let Some(mounts) = mounts.clone() {
            essence = essence.with_mounts(mounts);
        }
        vec![essence]
    } else {
        let file = args.file.as_deref().unwrap_or("-");
        let mut essences = if file == "-" {
            parse_essence_file(std::io::stdin().lock())
                .map_err(|e| CliError::BadInput(format!("bad essence input: {}", e)))?
        } else {
            let handle = std::fs::File::open(file)
                .map_err(|e| CliError::BadInput(format!("could not open {}: {}", file, e)))?;
            parse_essence_file(BufReader::new(handle))
                .map_err(|e| CliError::BadInput(format!("bad essence file {}: {}", file, e)))?
        };
        // -c and --mounts fill columns the file left out
        for essence in &mut essences {
            if essence.cwd.is_none() {
                essence.cwd = args.cwd.clone();
            }
            if essence.mounts.is_none() {
                essence.mounts = mounts.clone();
            }
        }
        essences
    };

    if essences.is_empty() {
        return Err(CliError::BadInput("no commands given".to_string()).into());
    }
    Ok(Request::Kill { essences })
}

pub async fn run(args: KillArgs, manager: &str) -> anyhow::Result<()> {
    let request = build_request(&args)?;
    let timeout = Duration::from_secs(args.timeout);

    let mut client = ManagerClient::connect(manager, timeout).await?;
    match client.send(&request).await? {
        Response::Killed { eligible: 0, .. } => Err(CliError::NoMatches.into()),
        Response::Killed { eligible, killed, first_error } => {
            output::info(&format!(
                "initiated the termination of {} running commands (out of {} eligible)",
                killed, eligible
            ));
            if let Some(error) = first_error {
                output::warn(&format!("some terminations failed: {}", error));
            }
            Ok(())
        }
        Response::Error { message } => Err(CliError::Manager(message).into()),
    }
}

#[cfg(test)]
#[path = "kill_tests.rs"]
mod tests;

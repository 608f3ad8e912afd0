use crate::{cli::actions::Action, config::ConfigSource};
use anyhow::{Result, anyhow};
use std::net::SocketAddr;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = matches
        .get_one::<String>("config")
        .map(|s| ConfigSource::from_arg(s))
        .ok_or_else(|| {
            anyhow!("Config is required. Please provide it using the --config flag.")
        })?;

    let http_addr = matches
        .get_one::<SocketAddr>("http-addr")
        .copied()
        .ok_or_else(|| anyhow!("HTTP address is required. Please provide it using --http-addr."))?;

    Ok(Action::Run { http_addr, config })
}

use crate::exporter::GIT_COMMIT_HASH;
use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::net::SocketAddr;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9300";

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("jira_exporter")
        .about("Jira issue count exporter for Prometheus")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(GIT_COMMIT_HASH)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file, - reads from stdin")
                .env("JIRA_EXPORTER_CONFIG")
                .value_name("PATH")
                .required(true),
        )
        .arg(
            Arg::new("http-addr")
                .long("http-addr")
                .help("Address to serve metrics on")
                .default_value(DEFAULT_HTTP_ADDR)
                .env("JIRA_EXPORTER_HTTP_ADDR")
                .value_name("ADDR")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for trace")
                .action(ArgAction::Count),
        )
}

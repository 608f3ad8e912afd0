pub mod run;

use crate::config::ConfigSource;
use std::net::SocketAddr;

#[derive(Debug)]
pub enum Action {
    Run {
        http_addr: SocketAddr,
        config: ConfigSource,
    },
}

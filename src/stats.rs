//! Fire-and-forget statsd metrics (Telegraf tag format).
//!
//! Counters are best effort: a missing or unreachable statsd daemon must
//! never slow down or fail an operation, so sends are non-blocking and
//! errors are only logged.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::{format_err, Error};

use crate::config::StatsdConfig;

pub struct StatsClient {
    target: Option<(UdpSocket, SocketAddr)>,
}

impl StatsClient {
    pub fn new(config: Option<&StatsdConfig>) -> Result<StatsClient, Error> {
        let target = match config {
            None => None,
            Some(config) => {
                let addr = (config.host.as_str(), config.port)
                    .to_socket_addrs()
                    .map_err(|err| format_err!("invalid statsd address {}:{} - {}", config.host, config.port, err))?
                    .next()
                    .ok_or_else(|| format_err!("statsd address {}:{} did not resolve", config.host, config.port))?;
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.set_nonblocking(true)?;
                Some((socket, addr))
            }
        };
        Ok(StatsClient { target })
    }

    pub fn disabled() -> StatsClient {
        StatsClient { target: None }
    }

    /// Increase counter `name` by one.
    pub fn increase(&self, name: &str, tags: &[(&str, &str)]) {
        self.send(&Self::format_counter(name, tags, 1));
    }

    fn format_counter(name: &str, tags: &[(&str, &str)], value: u64) -> String {
        let mut message = String::from(name);
        for (tag, tag_value) in tags {
            message.push(',');
            message.push_str(tag);
            message.push('=');
            message.push_str(tag_value);
        }
        message.push_str(&format!(":{}|c", value));
        message
    }

    fn send(&self, message: &str) {
        if let Some((socket, addr)) = &self.target {
            if let Err(err) = socket.send_to(message.as_bytes(), addr) {
                log::debug!("statsd send failed: {}", err);
            }
        }
    }
}

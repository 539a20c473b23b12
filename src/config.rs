use std::time::Duration;

use anyhow::bail;

pub struct ProxyConfig {
    pub connect_timeout: Duration,
    pub bind_timeout: Duration,
    pub listen_timeout: Duration,
    pub send_timeout: Duration,
    /// NB: receiving has no implicit deadline in the stream itself, this bounds a single
    ///  `receive` call on a socket
    pub receive_timeout: Duration,
    pub close_timeout: Duration,

    /// Timeout for a single `Link` request / response round trip with one proxy. Expiry fails
    ///  that candidate only.
    pub link_timeout: Duration,
    /// Bound on the `Open` handshake plus the stream connection's own open
    pub open_timeout: Duration,

    /// If nothing was sent on a stream for this long, the send pump emits a `Poll` so that
    ///  polled transports get a chance to deliver inbound messages
    pub poll_interval: Duration,
    /// The timeout the proxy is asked to hold a `Poll` for
    pub poll_timeout: Duration,

    /// Announced to the proxy in `Open`, this is the receive buffer the proxy may fill before
    ///  waiting for the client to catch up
    pub max_receive_buffer: u32,

    /// Stream type label sent in `Open`
    pub stream_type: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            connect_timeout: Duration::from_secs(60),
            bind_timeout: Duration::from_secs(60),
            listen_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(30),
            link_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(60),
            max_receive_buffer: 1024 * 1024,
            stream_type: "proxysocket".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, timeout) in [
            ("connect", self.connect_timeout),
            ("bind", self.bind_timeout),
            ("listen", self.listen_timeout),
            ("send", self.send_timeout),
            ("receive", self.receive_timeout),
            ("close", self.close_timeout),
            ("link", self.link_timeout),
            ("open", self.open_timeout),
        ] {
            if timeout.is_zero() {
                bail!("{} timeout must be positive", name);
            }
        }

        if self.poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        if self.poll_timeout < self.poll_interval {
            bail!("poll timeout ({:?}) must not be shorter than the poll interval ({:?})", self.poll_timeout, self.poll_interval);
        }
        if self.max_receive_buffer == 0 {
            bail!("max receive buffer must be positive");
        }
        if self.stream_type.is_empty() {
            bail!("stream type must not be empty");
        }

        Ok(())
    }
}

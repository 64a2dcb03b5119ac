use std::env;
use std::net::SocketAddr;

/// Server configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Address to listen on (e.g. 0.0.0.0:2500).
    pub listen_addr: SocketAddr,
    /// Greeting/Received-by domain name.
    pub domain: String,
    /// Maximum message body size in bytes, enforced via ESMTP SIZE and
    /// during DATA ingestion.
    pub max_message_bytes: u64,
    /// Maximum RCPT TO recipients per message.
    pub max_recipients: usize,
    /// Idle timeout applied to every read and write.
    pub max_idle_secs: u64,
    /// Maximum concurrent connections. 0 = unlimited.
    pub max_connections: usize,
    /// Maximum line length in bytes for SMTP command reads.
    pub max_line_length: usize,
    /// Metrics reporting interval in seconds. Set to 0 to disable.
    pub metrics_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// sane defaults for everything but the listen address.
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:2500".to_string())
            .parse()
            .expect("LISTEN_ADDR must be a valid socket address");

        let domain = env::var("DOMAIN").unwrap_or_else(|_| "inbucket".to_string());

        let max_message_bytes = env::var("MAX_MESSAGE_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10 * 1024 * 1024); // 10MB

        let max_recipients = env::var("MAX_RECIPIENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let max_idle_secs = env::var("MAX_IDLE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300); // 5 minutes

        let max_connections = env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let max_line_length = env::var("MAX_LINE_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);

        let metrics_interval_secs = env::var("METRICS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Config {
            listen_addr,
            domain,
            max_message_bytes,
            max_recipients,
            max_idle_secs,
            max_connections,
            max_line_length,
            metrics_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_optional_vars_unset() {
        // LISTEN_ADDR has a default too, so from_env() never panics here.
        let config = Config {
            listen_addr: "0.0.0.0:2500".parse().unwrap(),
            domain: "inbucket".to_string(),
            max_message_bytes: 10 * 1024 * 1024,
            max_recipients: 100,
            max_idle_secs: 300,
            max_connections: 1000,
            max_line_length: 1024,
            metrics_interval_secs: 60,
        };
        assert_eq!(config.domain, "inbucket");
        assert_eq!(config.max_recipients, 100);
    }
}

//! Peer directory parsing and quorum math.

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use error_stack::Report;

use crate::error::ConfigError;

/// Comma-separated `host:port` peer directory, as carried by the
/// `ACCEPTOR_HOSTS` / `LEARNER_HOSTS` / `PROPOSER_HOSTS` variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peers(Vec<String>);

impl Peers {
    #[must_use]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// Base URL (`http://host:port`) for the peer at `index`.
    #[must_use]
    pub fn url(&self, index: usize) -> Option<String> {
        self.0.get(index).map(|hp| format!("http://{hp}"))
    }

    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.0.iter().map(|hp| format!("http://{hp}")).collect()
    }

    /// Parser for clap arguments (clap wants a plain `String` error).
    ///
    /// # Errors
    ///
    /// Returns the rendered parse failure.
    pub fn parse_arg(s: &str) -> Result<Self, String> {
        s.parse().map_err(|report: Report<ConfigError>| report.to_string())
    }
}

impl FromStr for Peers {
    type Err = Report<ConfigError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hosts = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((host, port)) = part.rsplit_once(':') else {
                return Err(Report::new(ConfigError)
                    .attach_printable(format!("peer `{part}` is missing a `:port` suffix")));
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(
                    Report::new(ConfigError).attach_printable(format!("peer `{part}` is not `host:port`"))
                );
            }
            hosts.push(part.to_owned());
        }
        Ok(Peers(hosts))
    }
}

impl fmt::Display for Peers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// `Q = floor(N/2) + 1`; any two quorums intersect.
#[must_use]
pub fn quorum_size(total: usize) -> usize {
    total / 2 + 1
}

/// The follower timeout must cover at least two heartbeat periods, or a
/// single dropped heartbeat triggers an election.
///
/// # Errors
///
/// Returns [`ConfigError`] when `leader_timeout < 2 * heartbeat_interval`.
pub fn validate_timeouts(
    heartbeat_interval: Duration,
    leader_timeout: Duration,
) -> Result<(), Report<ConfigError>> {
    if leader_timeout < heartbeat_interval * 2 {
        return Err(Report::new(ConfigError).attach_printable(format!(
            "LEADER_TIMEOUT ({leader_timeout:?}) must be at least twice \
             HEARTBEAT_INTERVAL ({heartbeat_interval:?})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_hosts() {
        let peers: Peers = "acceptor1:5001, acceptor2:5002,acceptor3:5003".parse().unwrap();
        assert_eq!(peers.len(), 3);
        assert_eq!(peers.get(1), Some("acceptor2:5002"));
        assert_eq!(peers.url(0).unwrap(), "http://acceptor1:5001");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("acceptor1".parse::<Peers>().is_err());
        assert!("acceptor1:notaport".parse::<Peers>().is_err());
    }

    #[test]
    fn empty_string_is_empty_directory() {
        let peers: Peers = "".parse().unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn quorum_math() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn timeout_validation() {
        let hb = Duration::from_millis(500);
        assert!(validate_timeouts(hb, Duration::from_millis(1500)).is_ok());
        assert!(validate_timeouts(hb, Duration::from_millis(900)).is_err());
    }
}

//! Group descriptor and network configuration
//!
//! The group descriptor is the resolved view of the party set: the local id
//! and one address per party, in the same order on every process.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Dense, zero-based party identifier in `[0, n)`.
pub type PartyId = usize;

/// Default port from which all pair ports are derived.
pub const DEFAULT_BASE_PORT: u16 = 5000;

/// Default wait between two connection attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Local party id plus the ordered list of party addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDescriptor {
    local_id: PartyId,
    addresses: Vec<String>,
}

impl GroupDescriptor {
    /// Create a descriptor, validating that the local id is inside the group.
    pub fn new(local_id: PartyId, addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::Configuration("group must contain at least one party".into()));
        }
        if local_id >= addresses.len() {
            return Err(Error::Configuration(format!(
                "party id {} out of range for group of size {}",
                local_id,
                addresses.len()
            )));
        }
        Ok(Self {
            local_id,
            addresses,
        })
    }

    /// Group of `size` parties all living on 127.0.0.1.
    pub fn localhost(local_id: PartyId, size: usize) -> Result<Self> {
        Self::new(local_id, vec!["127.0.0.1".to_string(); size])
    }

    /// Load the addresses from a network file holding one address per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_file(local_id: PartyId, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("could not read network file {}: {}", path.display(), e))
        })?;
        Self::new(local_id, parse_addresses(&contents))
    }

    pub fn local_id(&self) -> PartyId {
        self.local_id
    }

    pub fn size(&self) -> usize {
        self.addresses.len()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Address of `party`, or `None` when out of range.
    pub fn address(&self, party: PartyId) -> Option<&str> {
        self.addresses.get(party).map(String::as_str)
    }
}

impl fmt::Display for GroupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(network: id={}, size={})", self.local_id, self.size())
    }
}

fn parse_addresses(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// How the initiator side of a pair retries a refused connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two attempts
    pub backoff: Duration,

    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Network configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Port all pair ports are derived from
    pub base_port: u16,

    /// Connect retry policy used during bootstrap
    pub retry: RetryPolicy,

    /// Deadline for a single accept (and the id exchange that follows)
    /// while bootstrapping. Without it, parties misconfigured so that none
    /// of them dials wait in `accept` forever.
    pub accept_timeout: Option<Duration>,

    /// Deadline for every send/receive on an established channel
    pub io_timeout: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            retry: RetryPolicy::default(),
            accept_timeout: None,
            io_timeout: None,
        }
    }
}

impl NetworkConfig {
    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Check that every port derived for a group of `size` parties fits in a u16.
    pub fn validate(&self, size: usize) -> Result<()> {
        let span = size
            .checked_mul(size)
            .ok_or_else(|| Error::Configuration(format!("group size {} too large", size)))?;
        let highest = self.base_port as usize + span.saturating_sub(1);
        if highest > u16::MAX as usize {
            return Err(Error::Configuration(format!(
                "base port {} leaves no room for {} parties (highest port {})",
                self.base_port, size, highest
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(Error::Configuration("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_rejects_bad_ids() {
        assert!(GroupDescriptor::new(0, vec![]).is_err());
        assert!(GroupDescriptor::localhost(3, 3).is_err());

        let desc = GroupDescriptor::localhost(2, 3).unwrap();
        assert_eq!(desc.local_id(), 2);
        assert_eq!(desc.size(), 3);
        assert_eq!(desc.address(1), Some("127.0.0.1"));
        assert_eq!(desc.address(3), None);
        assert_eq!(desc.to_string(), "(network: id=2, size=3)");
    }

    #[test]
    fn test_parse_network_file() {
        let contents = "10.0.0.1\n\n# backup box\n  10.0.0.2  \nnode-3.local\n";
        assert_eq!(
            parse_addresses(contents),
            vec!["10.0.0.1", "10.0.0.2", "node-3.local"]
        );
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("groupcomm-net-{}.txt", std::process::id()));
        std::fs::write(&path, "127.0.0.1\n127.0.0.1\n").unwrap();

        let desc = GroupDescriptor::from_file(1, &path).unwrap();
        assert_eq!(desc.size(), 2);
        assert!(GroupDescriptor::from_file(2, &path).is_err());

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            GroupDescriptor::from_file(0, &path),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let config = NetworkConfig::default();
        assert_eq!(config.base_port, 5000);
        assert!(config.validate(10).is_ok());

        let config = NetworkConfig::default().with_base_port(65000);
        assert!(config.validate(30).is_err());

        let config = NetworkConfig::default().with_retry(RetryPolicy {
            backoff: Duration::from_millis(1),
            max_attempts: Some(0),
        });
        assert!(config.validate(2).is_err());
    }

    #[test]
    fn test_retry_exhaustion() {
        let unbounded = RetryPolicy::default();
        assert!(!unbounded.exhausted(u32::MAX));

        let bounded = RetryPolicy {
            backoff: DEFAULT_BACKOFF,
            max_attempts: Some(3),
        };
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }
}

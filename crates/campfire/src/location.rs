//! Deterministic rendezvous location derivation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use url::Url;

use crate::relay::Secret;
use crate::CampfireError;

/// The quantized time window over which a location is stable.
///
/// Peers whose clocks drift by more than one epoch cannot meet.
pub const EPOCH: Duration = Duration::from_secs(60 * 60);

const RELAY_DOMAIN: &[u8] = b"ember campfire relay v0";
const SECRET_DOMAIN: &[u8] = b"ember campfire secret v0";

/// The epoch number containing `now`.
pub fn current_epoch(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / EPOCH.as_secs()
}

/// A derived, ephemeral meeting point: one relay from the candidate list and
/// an opaque secret keying the exchange there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampfireLocation {
    /// The chosen relay, verbatim from the candidate list.
    pub relay: String,
    /// 32-byte rendezvous secret for this epoch.
    pub secret: Secret,
}

impl CampfireLocation {
    /// Derive the location for the current epoch.
    ///
    /// Pure: any peer with the same PSK and relay list computes the same
    /// location at any instant inside the same epoch.
    pub fn find(psk: &[u8], relays: &[String]) -> Result<Self, CampfireError> {
        Self::find_at(psk, relays, current_epoch(SystemTime::now()))
    }

    /// Derive the location for a specific epoch.
    pub fn find_at(psk: &[u8], relays: &[String], epoch: u64) -> Result<Self, CampfireError> {
        if psk.is_empty() {
            return Err(CampfireError::EmptyPsk);
        }
        if relays.is_empty() {
            return Err(CampfireError::NoRelays);
        }

        let mut hasher = Sha256::new();
        hasher.update(RELAY_DOMAIN);
        hasher.update(psk);
        hasher.update(epoch.to_le_bytes());
        for relay in relays {
            hasher.update(relay.as_bytes());
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(index_bytes) % relays.len() as u64) as usize;

        let mut hasher = Sha256::new();
        hasher.update(SECRET_DOMAIN);
        hasher.update(psk);
        hasher.update(epoch.to_le_bytes());
        let secret: Secret = hasher.finalize().into();

        Ok(Self {
            relay: relays[index].clone(),
            secret,
        })
    }

    /// The relay's dialable `host:port`, with any URI scheme stripped.
    pub fn relay_host(&self) -> &str {
        match self.relay.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.relay,
        }
    }
}

/// A compact rendezvous descriptor: `camp://<relay_host>?fingerprint#<psk>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampfireUri {
    /// Relay host hint, `host` or `host:port`.
    pub relay: String,
    /// Certificate fingerprint of the relay, when pinned.
    pub fingerprint: Option<String>,
    /// The pre-shared key fragment.
    pub psk: Vec<u8>,
}

impl CampfireUri {
    pub fn parse(raw: &str) -> Result<Self, CampfireError> {
        let url =
            Url::parse(raw).map_err(|e| CampfireError::InvalidUri(format!("{raw}: {e}")))?;
        if url.scheme() != "camp" {
            return Err(CampfireError::InvalidUri(format!(
                "expected camp:// scheme, got {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CampfireError::InvalidUri("missing relay host".to_string()))?;
        let relay = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let psk = url
            .fragment()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| CampfireError::InvalidUri("missing psk fragment".to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            relay,
            fingerprint: url.query().map(str::to_string).filter(|q| !q.is_empty()),
            psk,
        })
    }
}

impl std::fmt::Display for CampfireUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "camp://{}", self.relay)?;
        if let Some(fingerprint) = &self.fingerprint {
            write!(f, "?{fingerprint}")?;
        }
        write!(f, "#{}", String::from_utf8_lossy(&self.psk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relays() -> Vec<String> {
        vec![
            "turn://r1.example.com:3478".to_string(),
            "turn://r2.example.com:3478".to_string(),
            "turn://r3.example.com:3478".to_string(),
        ]
    }

    #[test]
    fn test_derivation_is_pure_within_an_epoch() {
        let a = CampfireLocation::find_at(b"hello", &relays(), 42).unwrap();
        let b = CampfireLocation::find_at(b"hello", &relays(), 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_derivation_changes_across_epochs() {
        let a = CampfireLocation::find_at(b"hello", &relays(), 42).unwrap();
        let b = CampfireLocation::find_at(b"hello", &relays(), 43).unwrap();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn test_different_psks_derive_different_secrets() {
        let a = CampfireLocation::find_at(b"hello", &relays(), 42).unwrap();
        let b = CampfireLocation::find_at(b"olleh", &relays(), 42).unwrap();
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn test_relay_is_taken_from_the_list() {
        let relays = relays();
        let loc = CampfireLocation::find_at(b"hello", &relays, 7).unwrap();
        assert!(relays.contains(&loc.relay));
    }

    #[test]
    fn test_empty_inputs_are_rejected() {
        assert!(matches!(
            CampfireLocation::find_at(b"", &relays(), 0),
            Err(CampfireError::EmptyPsk)
        ));
        assert!(matches!(
            CampfireLocation::find_at(b"hello", &[], 0),
            Err(CampfireError::NoRelays)
        ));
    }

    #[test]
    fn test_relay_host_strips_scheme() {
        let loc = CampfireLocation {
            relay: "turn://r1.example.com:3478".to_string(),
            secret: [0u8; 32],
        };
        assert_eq!(loc.relay_host(), "r1.example.com:3478");
    }

    #[test]
    fn test_uri_round_trip() {
        let uri = CampfireUri::parse("camp://relay.example.com:4433?ab12cd#supersecret").unwrap();
        assert_eq!(uri.relay, "relay.example.com:4433");
        assert_eq!(uri.fingerprint.as_deref(), Some("ab12cd"));
        assert_eq!(uri.psk, b"supersecret");
        assert_eq!(
            uri.to_string(),
            "camp://relay.example.com:4433?ab12cd#supersecret"
        );
    }

    #[test]
    fn test_uri_requires_scheme_and_psk() {
        assert!(CampfireUri::parse("https://relay?x#psk").is_err());
        assert!(CampfireUri::parse("camp://relay?x").is_err());
    }
}

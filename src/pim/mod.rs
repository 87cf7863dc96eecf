//! UPB Powerline Interface Module (PIM) driver interface.
//!
//! The integration only ever talks to a driver through [`Pim`] and the
//! [`Element`]s it owns. Drivers are selected by URL scheme in [`open`];
//! the built-in one is the in-memory [`LoopbackPim`]. Serial and TCP
//! transports to a physical PIM are recognized but not provided.

pub mod element;
pub mod loopback;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

pub use element::{
    Change, ChangeCommand, Changeset, Command, Element, ElementIndex, ElementKind, PimRequest,
    MAX_LEVEL, RATE_INSTANT,
};
pub use loopback::{Inventory, LightSpec, LinkSpec, LoopbackPim};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid PIM url {0:?}: expected <scheme>://<address>")]
    InvalidUrl(String),

    #[error("PIM transport {0:?} is not available in this build")]
    UnsupportedTransport(String),

    #[error("cannot read UPStart export file {}: {source}", path.display())]
    ExportFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PIM flag {0:?}")]
    InvalidFlag(String),

    #[error("unknown {kind} {index}")]
    UnknownElement { kind: ElementKind, index: ElementIndex },

    #[error("PIM connect requires a running tokio runtime")]
    NoRuntime,

    #[error("PIM command channel is closed")]
    ChannelClosed,
}

/// Driver handle: the connection to one UPB panel and the elements behind it.
pub trait Pim: Send + Sync {
    /// Start talking to the panel. Must not block; connection upkeep is the
    /// driver's job from here on.
    fn connect(&self) -> Result<(), DriverError>;

    /// Stop the driver. Queued commands are dropped and later commands fail.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Follows `is_connected`; changes on every connect and disconnect.
    fn watch_connection(&self) -> watch::Receiver<bool>;

    /// All devices, ordered by index.
    fn lights(&self) -> Vec<Arc<Element>>;

    /// All links, ordered by index.
    fn links(&self) -> Vec<Arc<Element>>;
}

/// Driver options parsed from a `flags` string such as `"no_sync,tx_count=2"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(BTreeMap<String, String>);

impl Flags {
    /// A bare flag, or one whose value is not `false`/`0`/`no`.
    pub fn is_set(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(value) => !matches!(value.as_str(), "false" | "0" | "no"),
            None => false,
        }
    }
}

impl FromStr for Flags {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = BTreeMap::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (item, ""),
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(DriverError::InvalidFlag(item.to_string()));
            }
            flags.insert(key.to_ascii_lowercase(), value.to_ascii_lowercase());
        }
        Ok(Flags(flags))
    }
}

/// Everything a driver needs to be constructed.
#[derive(Debug, Clone)]
pub struct PimConfig {
    pub url: String,
    pub export_file: Option<PathBuf>,
    pub flags: Flags,
}

/// Construct the driver for `config.url`. The returned driver is not yet
/// connected.
pub fn open(config: &PimConfig, inventory: &Inventory) -> Result<Arc<dyn Pim>, DriverError> {
    let (scheme, address) = config
        .url
        .split_once("://")
        .ok_or_else(|| DriverError::InvalidUrl(config.url.clone()))?;
    if scheme.is_empty() {
        return Err(DriverError::InvalidUrl(config.url.clone()));
    }

    match scheme.to_ascii_lowercase().as_str() {
        "loopback" => {
            tracing::info!(address = %address, "Opening loopback PIM");
            Ok(Arc::new(LoopbackPim::new(config, inventory)?))
        }
        "serial" | "tcp" => Err(DriverError::UnsupportedTransport(scheme.to_string())),
        _ => Err(DriverError::InvalidUrl(config.url.clone())),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> PimConfig {
        PimConfig {
            url: url.to_string(),
            export_file: None,
            flags: Flags::default(),
        }
    }

    #[test]
    fn test_flags_parse() {
        let flags: Flags = "no_sync, tx_count=2,,Heartbeat=False".parse().unwrap();
        assert_eq!(flags, "no_sync,tx_count=2,heartbeat=false".parse().unwrap());
        assert!(flags.is_set("no_sync"));
        assert!(flags.is_set("tx_count"));
        assert!(!flags.is_set("heartbeat"));
        assert!(!flags.is_set("missing"));
    }

    #[test]
    fn test_flags_empty_string() {
        let flags: Flags = "".parse().unwrap();
        assert_eq!(flags, Flags::default());
    }

    #[test]
    fn test_flags_reject_blank_key() {
        assert!(matches!("=1".parse::<Flags>(), Err(DriverError::InvalidFlag(_))));
        assert!(matches!("a b".parse::<Flags>(), Err(DriverError::InvalidFlag(_))));
    }

    #[test]
    fn test_open_selects_loopback() {
        let pim = open(&config("loopback://pim"), &Inventory::default()).unwrap();
        assert!(!pim.is_connected());
        assert!(pim.lights().is_empty());
    }

    #[test]
    fn test_open_rejects_transports_and_bad_urls() {
        let inv = Inventory::default();
        assert!(matches!(
            open(&config("serial:///dev/ttyUSB0"), &inv),
            Err(DriverError::UnsupportedTransport(s)) if s == "serial"
        ));
        assert!(matches!(
            open(&config("tcp://10.0.0.5:2101"), &inv),
            Err(DriverError::UnsupportedTransport(_))
        ));
        assert!(matches!(open(&config("/dev/ttyUSB0"), &inv), Err(DriverError::InvalidUrl(_))));
        assert!(matches!(open(&config("://x"), &inv), Err(DriverError::InvalidUrl(_))));
        assert!(matches!(open(&config("http://x"), &inv), Err(DriverError::InvalidUrl(_))));
    }
}

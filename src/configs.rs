//! Configuration structs for the UCI context
//!
//! This module houses the datastructures that control how the engine frames,
//! queues and answers messages. The config is passed to [`Uci::new`].
//!
//! [`Uci::new`]: crate::uci::Uci::new

use alloc::vec::Vec;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::Error;

/// Largest payload a single UCI packet can carry in this protocol version
pub const MAX_PACKET_PAYLOAD: usize = 255;

/// UCI context configuration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UciConfig {
    /// Which side of the link this context plays.
    ///
    /// Defaults to [`Mode::Server`].
    pub mode: Mode,
    /// Maximum payload per packet for each message type.
    pub max_payload: MaxPayload,
    /// Maximum number of packets waiting in the TX queue.
    ///
    /// A message whose segments do not all fit is refused as a whole.
    pub tx_queue_limit: usize,
    /// Pre-allocate one block that is kept aside to answer commands when the
    /// allocator is exhausted.
    ///
    /// Defaults to `true`.
    pub reserve_response: bool,
}

impl Default for UciConfig {
    fn default() -> Self {
        UciConfig {
            mode: Default::default(),
            max_payload: Default::default(),
            tx_queue_limit: 32,
            reserve_response: true,
        }
    }
}

impl UciConfig {
    /// Checks that every field is in range
    pub fn validate(&self) -> Result<(), Error> {
        self.max_payload.validate()?;
        if self.tx_queue_limit == 0 {
            return Err(Error::InvalidConfiguration);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// The role of the context on the UCI link
pub enum Mode {
    /// UWB subsystem side: receives commands, sends responses and
    /// notifications.
    #[default]
    Server,
    /// Host side: sends commands, receives responses and notifications.
    Client,
}

/// Per message type payload limits
///
/// Every limit must be in `1..=255`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MaxPayload {
    /// Commands, responses and notifications.
    pub control: usize,
    /// Data packets.
    pub data: usize,
    /// SE testing commands and responses.
    pub se_testing: usize,
}

impl Default for MaxPayload {
    fn default() -> Self {
        MaxPayload {
            control: MAX_PACKET_PAYLOAD,
            data: MAX_PACKET_PAYLOAD,
            se_testing: MAX_PACKET_PAYLOAD,
        }
    }
}

impl MaxPayload {
    fn validate(&self) -> Result<(), Error> {
        let in_range = |v: usize| (1..=MAX_PACKET_PAYLOAD).contains(&v);
        if in_range(self.control) && in_range(self.data) && in_range(self.se_testing) {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration)
        }
    }
}

/// Identity reported by `CORE_GET_DEVICE_INFO`
///
/// Versions use the UCI encoding: major in the low byte, minor and
/// maintenance nibbles in the high byte.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// UCI generic version
    pub uci_version: u16,
    /// MAC version
    pub mac_version: u16,
    /// PHY version
    pub phy_version: u16,
    /// UCI test version
    pub uci_test_version: u16,
    /// Vendor specific information, at most 255 bytes are reported
    pub vendor_info: Vec<u8>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            uci_version: 0x0002,
            mac_version: 0x0002,
            phy_version: 0x0002,
            uci_test_version: 0x0002,
            vendor_info: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(UciConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_payload_is_rejected() {
        let mut config = UciConfig::default();
        config.max_payload.data = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration)));

        let mut config = UciConfig::default();
        config.max_payload.control = 256;
        assert!(matches!(config.validate(), Err(Error::InvalidConfiguration)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn configs_are_serde() {
        fn is_serde<T: serde::Serialize + serde::de::DeserializeOwned>() {}
        is_serde::<UciConfig>();
        is_serde::<DeviceInfo>();
    }
}

//! Enumeration for UCI status codes
//!
//! A status byte leads every response payload and many notifications.

#[cfg(feature = "defmt")]
use defmt::Format;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Status code carried in responses and notifications
pub enum Status {
	/// Success
	OK                                  = 0x00,
	/// Intended operation is not supported in the current state
	REJECTED                            = 0x01,
	/// Intended operation failed to complete
	FAILED                              = 0x02,
	/// Malformed UCI packet
	SYNTAX_ERROR                        = 0x03,
	/// Config ID is not correct, and it is not present in UWBS
	INVALID_PARAM                       = 0x04,
	/// Config ID is correct, and value is not in proper range
	INVALID_RANGE                       = 0x05,
	/// Payload size does not fit the message
	INVALID_MESSAGE_SIZE                = 0x06,
	/// Unknown group id
	UNKNOWN_GID                         = 0x07,
	/// Unknown opcode id
	UNKNOWN_OID                         = 0x08,
	/// Config ID is read-only
	READ_ONLY                           = 0x09,
	/// UWBS requests retransmission from the host
	COMMAND_RETRY                       = 0x0A,
	/// Status code is not known
	UNKNOWN                             = 0x0B,
	/// Parameter is not applicable for the requested operation
	NOT_APPLICABLE                      = 0x0C,
	/// Session does not exist (is not created)
	ERROR_SESSION_NOT_EXIST             = 0x11,
	/// Session exists (is already created)
	ERROR_SESSION_DUPLICATE             = 0x12,
	/// Session is active
	ERROR_SESSION_ACTIVE                = 0x13,
	/// Maximum number of sessions is reached
	ERROR_MAX_SESSIONS_EXCEEDED         = 0x14,
	/// Session is not configured with required app configurations
	ERROR_SESSION_NOT_CONFIGURED        = 0x15,
	/// Sessions are actively running in UWBS
	ERROR_ACTIVE_SESSIONS_ONGOING       = 0x16,
	/// Indicates when multicast list is full during one to many ranging
	ERROR_MULTICAST_LIST_FULL           = 0x17,
	/// Indicates when short address is not available in multicast list
	ERROR_ADDRESS_NOT_FOUND             = 0x18,
	/// Indicates when short address is already present in multicast list
	ERROR_ADDRESS_ALREADY_PRESENT       = 0x19,
	/// UWB initiation time is already in the past
	ERROR_UWB_INITIATION_TIME_TOO_OLD   = 0x1A,
	/// Ranging was successful with a negative distance
	OK_NEGATIVE_DISTANCE_REPORT         = 0x1B,
	/// Failed to transmit UWB packet
	RANGING_TX_FAILED                   = 0x20,
	/// No UWB packet detected by the receiver
	RANGING_RX_TIMEOUT                  = 0x21,
	/// UWB packet channel decoding error
	RANGING_RX_PHY_DEC_FAILED           = 0x22,
	/// Failed to detect time of arrival of the UWB packet
	RANGING_RX_PHY_TOA_FAILED           = 0x23,
	/// UWB packet STS segment mismatch
	RANGING_RX_PHY_STS_FAILED           = 0x24,
	/// MAC CRC or syntax error
	RANGING_RX_MAC_DEC_FAILED           = 0x25,
	/// IE syntax error
	RANGING_RX_MAC_IE_DEC_FAILED        = 0x26,
	/// Expected IE missing in the packet
	RANGING_RX_MAC_IE_MISSING           = 0x27,
	/// Round index is not activated for ranging
	ERROR_ROUND_INDEX_NOT_ACTIVATED     = 0x28,
	/// Number of active ranging rounds exceeds the supported maximum
	ERROR_NUMBER_OF_ACTIVE_RANGING_ROUNDS_EXCEEDED = 0x29,
	/// DL-TDoA device address mismatch in the reply time list
	ERROR_DL_TDOA_DEVICE_ADDRESS_NOT_MATCHING_IN_REPLY_TIME_LIST = 0x2A,
	/// Application data exceeds the maximum transmit size
	DATA_MAX_TX_APDU_SIZE_EXCEEDED      = 0x30,
	/// Received application data failed its CRC check
	DATA_RX_CRC_ERROR                   = 0x31,
}

/// Coarse classification of a raw status byte
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum StatusCategory {
	/// 0x00..=0x0F
	Generic,
	/// 0x10..=0x1F
	Session,
	/// 0x20..=0x2F
	Ranging,
	/// 0x30..=0x3F
	Data,
	/// 0x50..=0xFF, vendor proprietary
	Proprietary,
	/// Anything else
	Reserved,
}

impl Status {
	/// Looks up a known status code
	pub fn from_u8(value: u8) -> Option<Self> {
		use Status::*;

		let status = match value {
			0x00 => OK,
			0x01 => REJECTED,
			0x02 => FAILED,
			0x03 => SYNTAX_ERROR,
			0x04 => INVALID_PARAM,
			0x05 => INVALID_RANGE,
			0x06 => INVALID_MESSAGE_SIZE,
			0x07 => UNKNOWN_GID,
			0x08 => UNKNOWN_OID,
			0x09 => READ_ONLY,
			0x0A => COMMAND_RETRY,
			0x0B => UNKNOWN,
			0x0C => NOT_APPLICABLE,
			0x11 => ERROR_SESSION_NOT_EXIST,
			0x12 => ERROR_SESSION_DUPLICATE,
			0x13 => ERROR_SESSION_ACTIVE,
			0x14 => ERROR_MAX_SESSIONS_EXCEEDED,
			0x15 => ERROR_SESSION_NOT_CONFIGURED,
			0x16 => ERROR_ACTIVE_SESSIONS_ONGOING,
			0x17 => ERROR_MULTICAST_LIST_FULL,
			0x18 => ERROR_ADDRESS_NOT_FOUND,
			0x19 => ERROR_ADDRESS_ALREADY_PRESENT,
			0x1A => ERROR_UWB_INITIATION_TIME_TOO_OLD,
			0x1B => OK_NEGATIVE_DISTANCE_REPORT,
			0x20 => RANGING_TX_FAILED,
			0x21 => RANGING_RX_TIMEOUT,
			0x22 => RANGING_RX_PHY_DEC_FAILED,
			0x23 => RANGING_RX_PHY_TOA_FAILED,
			0x24 => RANGING_RX_PHY_STS_FAILED,
			0x25 => RANGING_RX_MAC_DEC_FAILED,
			0x26 => RANGING_RX_MAC_IE_DEC_FAILED,
			0x27 => RANGING_RX_MAC_IE_MISSING,
			0x28 => ERROR_ROUND_INDEX_NOT_ACTIVATED,
			0x29 => ERROR_NUMBER_OF_ACTIVE_RANGING_ROUNDS_EXCEEDED,
			0x2A => ERROR_DL_TDOA_DEVICE_ADDRESS_NOT_MATCHING_IN_REPLY_TIME_LIST,
			0x30 => DATA_MAX_TX_APDU_SIZE_EXCEEDED,
			0x31 => DATA_RX_CRC_ERROR,
			_ => return None,
		};

		Some(status)
	}

	/// Classifies any raw status byte, known or not
	pub fn category(value: u8) -> StatusCategory {
		match value {
			0x00..=0x0F => StatusCategory::Generic,
			0x10..=0x1F => StatusCategory::Session,
			0x20..=0x2F => StatusCategory::Ranging,
			0x30..=0x3F => StatusCategory::Data,
			0x50..=0xFF => StatusCategory::Proprietary,
			_ => StatusCategory::Reserved,
		}
	}

	/// `true` for the two success codes
	pub fn is_ok(self) -> bool {
		matches!(self, Status::OK | Status::OK_NEGATIVE_DISTANCE_REPORT)
	}
}

impl From<Status> for u8 {
	fn from(status: Status) -> u8 {
		status as u8
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn known_codes_round_trip() {
		for raw in 0..=u8::MAX {
			if let Some(status) = Status::from_u8(raw) {
				assert_eq!(u8::from(status), raw);
			}
		}
		assert_eq!(Status::from_u8(0x0D), None);
		assert_eq!(Status::from_u8(0x50), None);
	}

	#[test]
	fn categories() {
		assert_eq!(Status::category(Status::UNKNOWN_OID as u8), StatusCategory::Generic);
		assert_eq!(
			Status::category(Status::ERROR_SESSION_NOT_EXIST as u8),
			StatusCategory::Session
		);
		assert_eq!(Status::category(Status::RANGING_RX_TIMEOUT as u8), StatusCategory::Ranging);
		assert_eq!(Status::category(Status::DATA_RX_CRC_ERROR as u8), StatusCategory::Data);
		assert_eq!(Status::category(0x52), StatusCategory::Proprietary);
		assert_eq!(Status::category(0x45), StatusCategory::Reserved);
	}
}

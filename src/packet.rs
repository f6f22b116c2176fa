//! UCI packet framing
//!
//! Every UCI packet starts with a 4 byte header. The layout of the header
//! depends on the message type:
//!
//! | type              | byte 0                | byte 1     | byte 2     | byte 3      |
//! |-------------------|-----------------------|------------|------------|-------------|
//! | control (1, 2, 3) | `MT:3 PBF:1 GID:4`    | `RFU:2 OID:6` | RFU     | length      |
//! | data (0)          | `MT:3 PBF:1 DPF:4`    | RFU        | length LSB | length MSB  |
//! | SE testing (4, 5) | `MT:3 PBF:1 GID:4`    | `RFU:2 OID:6` | length LSB | length MSB |
//!
//! Messages longer than the maximum packet payload are split into segments.
//! All segments but the last carry the [`PacketBoundary::Segment`] flag.

use core::cmp::Ordering;

use byte::{check_len, ctx::LE, BytesExt as _, TryRead, TryWrite};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{
    block::{Allocator, Block, BlockFlags},
    message::MessageReader,
    Error,
};

/// Length of the common packet header
pub const HEADER_LEN: usize = 4;

/// Group identifiers
pub mod gid {
    /// UCI core group
    pub const CORE: u8 = 0x0;
    /// Session configuration group
    pub const SESSION_CONFIG: u8 = 0x1;
    /// Session control group
    pub const SESSION_CONTROL: u8 = 0x2;
    /// Data control group
    pub const DATA_CONTROL: u8 = 0x3;
    /// Test group
    pub const TEST: u8 = 0xD;
}

/// Opcode identifiers of the core group
pub mod core_oid {
    pub const DEVICE_RESET: u8 = 0x00;
    pub const DEVICE_STATUS_NTF: u8 = 0x01;
    pub const GET_DEVICE_INFO: u8 = 0x02;
    pub const GET_CAPS_INFO: u8 = 0x03;
    pub const SET_CONFIG: u8 = 0x04;
    pub const GET_CONFIG: u8 = 0x05;
    pub const GENERIC_ERROR_NTF: u8 = 0x07;
}

/// Data packet formats
pub mod dpf {
    /// Data message sent by the host
    pub const DATA_MESSAGE_SND: u8 = 0x1;
    /// Data message received over the air
    pub const DATA_MESSAGE_RCV: u8 = 0x2;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Message type, the top 3 bits of every header
pub enum MessageType {
    /// Data packet
    Data = 0,
    /// Control command
    Command = 1,
    /// Control response
    Response = 2,
    /// Control notification
    Notification = 3,
    /// SE testing command
    SeTestingCommand = 4,
    /// SE testing response
    SeTestingResponse = 5,
}

impl MessageType {
    /// Decodes the 3 bit field, 6 and 7 are reserved
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Data),
            1 => Some(MessageType::Command),
            2 => Some(MessageType::Response),
            3 => Some(MessageType::Notification),
            4 => Some(MessageType::SeTestingCommand),
            5 => Some(MessageType::SeTestingResponse),
            _ => None,
        }
    }

    /// Command, response or notification
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::Command | MessageType::Response | MessageType::Notification
        )
    }

    /// SE testing command or response
    pub fn is_se_testing(self) -> bool {
        matches!(
            self,
            MessageType::SeTestingCommand | MessageType::SeTestingResponse
        )
    }

    /// Command or SE testing command
    pub fn is_command(self) -> bool {
        matches!(self, MessageType::Command | MessageType::SeTestingCommand)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Packet boundary flag
pub enum PacketBoundary {
    /// Last (or only) packet of a message
    Complete = 0,
    /// More packets follow
    Segment = 1,
}

/// 16 bit key addressing a message: type, group (or DPF) and opcode
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageId {
    mt: MessageType,
    gid: u8,
    oid: u8,
}

impl MessageId {
    /// Control or SE testing message id
    pub const fn new(mt: MessageType, gid: u8, oid: u8) -> Self {
        MessageId {
            mt,
            gid: gid & 0x0F,
            oid: oid & 0x3F,
        }
    }

    /// Data message id for the given data packet format
    pub const fn data(dpf: u8) -> Self {
        MessageId::new(MessageType::Data, dpf, 0)
    }

    /// Command id
    pub const fn command(gid: u8, oid: u8) -> Self {
        MessageId::new(MessageType::Command, gid, oid)
    }

    /// Response id
    pub const fn response(gid: u8, oid: u8) -> Self {
        MessageId::new(MessageType::Response, gid, oid)
    }

    /// Notification id
    pub const fn notification(gid: u8, oid: u8) -> Self {
        MessageId::new(MessageType::Notification, gid, oid)
    }

    /// Message type
    pub fn mt(&self) -> MessageType {
        self.mt
    }

    /// Group id, or DPF for data messages
    pub fn gid(&self) -> u8 {
        self.gid
    }

    /// Data packet format, an alias of [`MessageId::gid`]
    pub fn dpf(&self) -> u8 {
        self.gid
    }

    /// Opcode id, always 0 for data messages
    pub fn oid(&self) -> u8 {
        self.oid
    }

    /// Packed 16 bit key
    pub fn raw(&self) -> u16 {
        (self.mt as u16) << 13 | (self.gid as u16) << 8 | self.oid as u16
    }

    /// Id of the response answering this command
    pub fn to_response(&self) -> Self {
        let mt = match self.mt {
            MessageType::SeTestingCommand => MessageType::SeTestingResponse,
            MessageType::Command => MessageType::Response,
            other => other,
        };
        MessageId::new(mt, self.gid, self.oid)
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().cmp(&other.raw())
    }
}

/// Decoded packet header
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct PacketHeader {
    /// Message type
    pub mt: MessageType,
    /// Packet boundary flag
    pub pbf: PacketBoundary,
    /// Group id, or DPF for data packets
    pub gid: u8,
    /// Opcode id, 0 for data packets
    pub oid: u8,
    /// Length of the payload following the header
    pub payload_len: u16,
}

impl PacketHeader {
    /// Header of one packet of message `id`
    pub fn new(id: MessageId, pbf: PacketBoundary, payload_len: u16) -> Self {
        PacketHeader {
            mt: id.mt(),
            pbf,
            gid: id.gid(),
            oid: id.oid(),
            payload_len,
        }
    }

    /// Id of the message this packet belongs to
    pub fn id(&self) -> MessageId {
        MessageId::new(self.mt, self.gid, self.oid)
    }

    /// `true` if more packets of the same message follow
    pub fn is_segment(&self) -> bool {
        self.pbf == PacketBoundary::Segment
    }

    /// Decodes a header from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bytes.read_with(&mut 0, ())?)
    }

    /// Encodes the header
    ///
    /// Fails for a control header whose payload doesn't fit its one byte
    /// length field.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN], Error> {
        let mut bytes = [0; HEADER_LEN];
        bytes.write_with(&mut 0, *self, ())?;
        Ok(bytes)
    }
}

impl<'a> TryRead<'a> for PacketHeader {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        check_len(bytes, HEADER_LEN)?;

        let mt = MessageType::from_u8(bytes[0] >> 5).ok_or(byte::Error::BadInput {
            err: "reserved message type",
        })?;
        let pbf = if bytes[0] & 0x10 != 0 {
            PacketBoundary::Segment
        } else {
            PacketBoundary::Complete
        };
        let gid = bytes[0] & 0x0F;

        let (oid, payload_len) = match mt {
            MessageType::Data => (0, bytes.read_with::<u16>(&mut 2, LE)?),
            MessageType::SeTestingCommand | MessageType::SeTestingResponse => {
                (bytes[1] & 0x3F, bytes.read_with::<u16>(&mut 2, LE)?)
            }
            _ => (bytes[1] & 0x3F, bytes[3] as u16),
        };

        let header = PacketHeader {
            mt,
            pbf,
            gid,
            oid,
            payload_len,
        };
        Ok((header, HEADER_LEN))
    }
}

impl TryWrite for PacketHeader {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        check_len(bytes, HEADER_LEN)?;

        bytes[0] = (self.mt as u8) << 5 | (self.pbf as u8) << 4 | (self.gid & 0x0F);
        match self.mt {
            MessageType::Data => {
                bytes[1] = 0;
                bytes.write_with(&mut 2, self.payload_len, LE)?;
            }
            MessageType::SeTestingCommand | MessageType::SeTestingResponse => {
                bytes[1] = self.oid & 0x3F;
                bytes.write_with(&mut 2, self.payload_len, LE)?;
            }
            _ => {
                if self.payload_len > u8::MAX as u16 {
                    return Err(byte::Error::BadInput {
                        err: "control payload longer than 255 bytes",
                    });
                }
                bytes[1] = self.oid & 0x3F;
                bytes[2] = 0;
                bytes[3] = self.payload_len as u8;
            }
        }
        Ok(HEADER_LEN)
    }
}

/// Splits a message into wire packets
///
/// Every produced block holds the header followed by at most `max_payload`
/// bytes of payload. An empty payload yields a single complete packet.
/// Either every packet is produced or none: on allocation failure the packets
/// built so far are released and `Error::NoMemory` is returned.
///
/// Continuation segments of a `DATA_MESSAGE_SND` start with the session
/// handle of the first segment, counted against `max_payload`.
pub fn segment(
    allocator: &dyn Allocator,
    id: MessageId,
    payload: Option<&Block>,
    max_payload: usize,
) -> Result<Block, Error> {
    let total = payload.map_or(0, Block::chain_len);
    let max_payload = max_payload.max(1);
    let mut reader = MessageReader::new(payload);

    let mut handle = [0; 4];
    let repeat_handle = id == MessageId::data(dpf::DATA_MESSAGE_SND) && total > max_payload;
    if repeat_handle {
        if max_payload <= handle.len() {
            return Err(Error::InvalidArgument);
        }
        reader.clone().read_into(&mut handle)?;
    }

    let mut head: Option<Block> = None;
    let mut remaining = total;
    loop {
        let prefix = if repeat_handle && head.is_some() {
            handle.len()
        } else {
            0
        };
        let chunk = remaining.min(max_payload - prefix);
        remaining -= chunk;
        let pbf = if remaining > 0 {
            PacketBoundary::Segment
        } else {
            PacketBoundary::Complete
        };

        let mut packet = allocator
            .alloc(prefix + chunk, BlockFlags::HEADER_RESERVED)
            .ok_or(Error::NoMemory)?;
        let header = PacketHeader::new(id, pbf, (prefix + chunk) as u16).encode()?;
        let room = packet.push_front(HEADER_LEN).ok_or(Error::NoMemory)?;
        room.copy_from_slice(&header);
        packet.put(&handle[..prefix])?;
        reader.copy_into(&mut packet, chunk)?;

        match head.as_mut() {
            Some(head) => head.append(packet),
            None => head = Some(packet),
        }
        if remaining == 0 {
            break;
        }
    }

    head.ok_or(Error::NoMemory)
}

/// Splits a segment chain built by [`segment`] into its packets
pub fn split_packets(chain: Block) -> impl Iterator<Item = Block> {
    let mut rest = Some(chain);
    core::iter::from_fn(move || {
        let mut packet = rest.take()?;
        rest = packet.take_next();
        Some(packet)
    })
}

/// Progress of a data message being reassembled
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct DataProgress {
    /// Application data length announced by the first segment
    pub app_data_len: usize,
    /// Application data bytes still expected
    pub app_data_rem_len: usize,
    /// Session the data message belongs to
    pub session_handle: u32,
}

/// Bytes preceding the application data in the first data segment:
/// session handle, destination address, sequence number, data length.
pub const DATA_SND_PREAMBLE_LEN: usize = 4 + 8 + 2 + 2;

/// A reassembled message
#[derive(Debug)]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Payload chain, `None` when the message is empty
    pub payload: Option<Block>,
}

/// Outcome of feeding one packet to the [`Reassembler`]
#[derive(Debug)]
pub enum Reassembly {
    /// More segments are expected
    Pending,
    /// The message is complete
    Complete(Message),
}

/// Accumulates segments until a message is complete
///
/// Once a segment is dropped the rest of its message is skipped: packets of
/// that message are passed to [`Reassembler::skips`] and eaten up to and
/// including the one flagged [`PacketBoundary::Complete`].
#[derive(Default)]
pub struct Reassembler {
    rx: Option<Block>,
    first: Option<PacketHeader>,
    data: Option<DataProgress>,
    skipping: Option<MessageId>,
}

impl Reassembler {
    /// Creates an idle reassembler
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// `true` while segments of a message are being collected
    pub fn in_progress(&self) -> bool {
        self.first.is_some()
    }

    /// Header of the first segment of the message being collected
    pub fn pending_id(&self) -> Option<MessageId> {
        self.first.map(|header| header.id())
    }

    /// Drops the message being collected and its blocks
    pub fn discard(&mut self) {
        if self.first.is_some() {
            debug!("discarding partial message");
        }
        self.rx = None;
        self.first = None;
        self.data = None;
    }

    /// Drops the message being collected and skips the rest of message `id`
    pub fn skip_rest(&mut self, id: MessageId) {
        self.discard();
        debug!("skipping the rest of message {}", id.raw());
        self.skipping = Some(id);
    }

    /// Drops the message being collected after `header` was refused
    ///
    /// A refused segment leaves the rest of its message to skip.
    pub fn abandon(&mut self, header: &PacketHeader) {
        if header.is_segment() {
            self.skip_rest(header.id());
        } else {
            self.discard();
        }
    }

    /// Message whose remaining packets are being skipped
    pub fn skipping(&self) -> Option<MessageId> {
        self.skipping
    }

    /// `true` if the packet with `header` belongs to the skipped message
    ///
    /// Must be asked before the packet is pushed. A packet of another message
    /// ends the skip, since the skipped message is then abandoned.
    pub fn skips(&mut self, header: &PacketHeader) -> bool {
        let Some(id) = self.skipping else {
            return false;
        };
        if id != header.id() {
            warn!("message {} abandoned before its last segment", id.raw());
            self.skipping = None;
            return false;
        }
        trace!("skipped segment of message {}", id.raw());
        if !header.is_segment() {
            self.skipping = None;
        }
        true
    }

    /// Adds one packet payload, the header already stripped
    ///
    /// On error the partial message is discarded, and the rest of the
    /// refused packet's message is skipped.
    pub fn push(&mut self, header: PacketHeader, payload: Block) -> Result<Reassembly, Error> {
        let result = self.push_inner(header, payload);
        if result.is_err() {
            self.abandon(&header);
        }
        result
    }

    fn push_inner(
        &mut self,
        header: PacketHeader,
        mut payload: Block,
    ) -> Result<Reassembly, Error> {
        match self.first {
            Some(first) => {
                if first.id() != header.id() {
                    warn!(
                        "segment {:?} interleaved with message {:?}",
                        header.id().raw(),
                        first.id().raw()
                    );
                    return Err(Error::SegmentMismatch);
                }
                if header.id() == MessageId::data(dpf::DATA_MESSAGE_SND) {
                    self.continue_data(&mut payload)?;
                }
            }
            None => {
                if header.id() == MessageId::data(dpf::DATA_MESSAGE_SND) {
                    self.start_data(&payload)?;
                }
                self.first = Some(header);
            }
        }

        if !payload.is_empty() {
            match self.rx.as_mut() {
                Some(rx) => rx.append(payload),
                None => self.rx = Some(payload),
            }
        }

        if header.is_segment() {
            return Ok(Reassembly::Pending);
        }

        if let Some(progress) = self.data {
            if progress.app_data_rem_len != 0 {
                warn!(
                    "data message ended with {} bytes missing",
                    progress.app_data_rem_len
                );
                return Err(Error::DataLengthMismatch);
            }
        }

        let id = header.id();
        let mut payload = self.rx.take();
        if let Some(head) = payload.as_mut() {
            head.update_total_len();
        }
        self.first = None;
        self.data = None;
        Ok(Reassembly::Complete(Message { id, payload }))
    }

    fn start_data(&mut self, payload: &Block) -> Result<(), Error> {
        let mut reader = MessageReader::new(Some(payload));
        let session_handle = reader.read_u32_le()?;
        reader.skip(8 + 2)?;
        let app_data_len = reader.read_u16_le()? as usize;
        let carried = reader.remaining();
        if carried > app_data_len {
            return Err(Error::DataLengthMismatch);
        }
        self.data = Some(DataProgress {
            app_data_len,
            app_data_rem_len: app_data_len - carried,
            session_handle,
        });
        Ok(())
    }

    fn continue_data(&mut self, payload: &mut Block) -> Result<(), Error> {
        let Some(progress) = self.data.as_mut() else {
            return Err(Error::SegmentMismatch);
        };
        let session_handle = MessageReader::new(Some(&*payload)).read_u32_le()?;
        if session_handle != progress.session_handle {
            warn!(
                "data segment for session {} while reassembling session {}",
                session_handle,
                progress.session_handle
            );
            return Err(Error::SessionMismatch);
        }
        payload.pull_front(4)?;
        if payload.len() > progress.app_data_rem_len {
            return Err(Error::DataLengthMismatch);
        }
        progress.app_data_rem_len -= payload.len();
        Ok(())
    }
}

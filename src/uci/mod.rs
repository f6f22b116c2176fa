//! UCI core context
//!
//! The entry point is the [`Uci`] struct. It owns the handler registry, the
//! reassembly state and a [`UciCore`], the part handlers get to see: the
//! allocator, the TX queue, the attached transport and the device state.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};

#[cfg(feature = "defmt")]
use defmt::Format;

pub use device::*;
pub use error::*;
pub use registry::{HandlerFn, HandlerToken, MessageHandlers};
pub use transport::*;

use crate::{
    block::{Allocator, Block, BlockFlags},
    configs::{Mode, UciConfig},
    packet::{
        core_oid, gid, segment, split_packets, MessageId, MessageType, PacketBoundary,
        PacketHeader, Reassembler, Reassembly, HEADER_LEN,
    },
    Status,
};
use registry::Registry;

mod device;
mod error;
mod registry;
mod transport;

/// Payload room of the emergency response block
const RESERVE_LEN: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// State of the UWB subsystem as reported by `CORE_DEVICE_STATUS_NTF`
pub enum DeviceState {
    /// Ready to accept commands
    Ready = 0x01,
    /// At least one session is running
    Active = 0x02,
    /// An unrecoverable error occured, a reset is needed
    Error = 0xFF,
}

/// State shared with message handlers
pub struct UciCore {
    allocator: Box<dyn Allocator>,
    config: UciConfig,
    transport: Option<Box<dyn Transport>>,
    tx: VecDeque<Block>,
    loaned: bool,
    resp: Option<Block>,
    device_state: DeviceState,
    awaiting: Option<MessageId>,
    current_command: Option<MessageId>,
    responded: bool,
}

impl UciCore {
    fn new(config: UciConfig, allocator: Box<dyn Allocator>) -> Self {
        let mut core = UciCore {
            allocator,
            config,
            transport: None,
            tx: VecDeque::new(),
            loaned: false,
            resp: None,
            device_state: DeviceState::Ready,
            awaiting: None,
            current_command: None,
            responded: false,
        };
        core.refill_reserve();
        core
    }

    /// Allocator backing every block of this context
    pub fn allocator(&self) -> &dyn Allocator {
        &*self.allocator
    }

    /// Context configuration
    pub fn config(&self) -> &UciConfig {
        &self.config
    }

    /// `true` in server (UWB subsystem) mode
    pub fn is_server(&self) -> bool {
        self.config.mode == Mode::Server
    }

    /// Allocates a block, logging exhaustion
    pub fn alloc(&self, size_hint: usize, flags: BlockFlags) -> Option<Block> {
        let block = self.allocator.alloc(size_hint, flags);
        if block.is_none() {
            debug!("allocation of {} bytes failed", size_hint);
        }
        block
    }

    /// Packets waiting in the TX queue
    pub fn tx_pending(&self) -> usize {
        self.tx.len()
    }

    fn max_payload(&self, mt: MessageType) -> usize {
        let max = &self.config.max_payload;
        match mt {
            MessageType::Data => max.data,
            MessageType::SeTestingCommand | MessageType::SeTestingResponse => max.se_testing,
            _ => max.control,
        }
    }

    fn refill_reserve(&mut self) {
        if self.config.reserve_response && self.resp.is_none() {
            self.resp = self.alloc(RESERVE_LEN, BlockFlags::HEADER_RESERVED);
        }
    }

    fn signal_send_ready(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.packet_send_ready();
        }
    }

    /// Queues a message for sending, segmenting it as needed
    ///
    /// The payload is consumed whatever the outcome. The message is queued as
    /// a whole or not at all.
    pub fn send_message(&mut self, id: MessageId, payload: Option<Block>) -> Result<(), Error> {
        let max = self.max_payload(id.mt());
        let len = payload.as_ref().map_or(0, Block::chain_len);

        let packets = match payload {
            Some(mut block)
                if block.next().is_none() && block.headroom() >= HEADER_LEN && len <= max =>
            {
                let header =
                    PacketHeader::new(id, PacketBoundary::Complete, len as u16).encode()?;
                let room = block.push_front(HEADER_LEN).ok_or(Error::NoMemory)?;
                room.copy_from_slice(&header);
                alloc::vec![block]
            }
            payload => {
                let chain = segment(&*self.allocator, id, payload.as_ref(), max)?;
                split_packets(chain).collect::<Vec<_>>()
            }
        };

        self.enqueue(id, packets)
    }

    fn enqueue(&mut self, id: MessageId, packets: Vec<Block>) -> Result<(), Error> {
        if self.tx.len() + packets.len() > self.config.tx_queue_limit {
            warn!(
                "tx queue full, dropping message {} of {} packets",
                id.raw(),
                packets.len()
            );
            return Err(Error::NoMemory);
        }

        if self.current_command.map(|cmd| cmd.to_response()) == Some(id) {
            self.responded = true;
        }

        let was_empty = self.tx.is_empty();
        self.tx.extend(packets);
        if was_empty {
            self.signal_send_ready();
        }
        Ok(())
    }

    /// Queues a message whose payload is a plain byte slice
    pub fn send_bytes(&mut self, id: MessageId, payload: &[u8]) -> Result<(), Error> {
        if payload.is_empty() {
            return self.send_message(id, None);
        }
        let mut block = self
            .alloc(payload.len(), BlockFlags::HEADER_RESERVED)
            .ok_or(Error::NoMemory)?;
        block.put(payload)?;
        self.send_message(id, Some(block))
    }

    /// Answers command `cmd` with a response carrying only `status`
    ///
    /// Falls back to the emergency block when the allocator is exhausted.
    pub fn send_status(&mut self, cmd: MessageId, status: Status) -> Result<(), Error> {
        let mut block = match self.alloc(1, BlockFlags::HEADER_RESERVED) {
            Some(block) => block,
            None => {
                debug!("using emergency response block");
                self.resp.take().ok_or(Error::NoMemory)?
            }
        };
        block.put(&[status as u8])?;
        self.send_message(cmd.to_response(), Some(block))
    }

    /// Queues an SE testing command or response
    pub fn send_se_message(&mut self, id: MessageId, payload: Option<Block>) -> Result<(), Error> {
        if !id.mt().is_se_testing() {
            return Err(Error::InvalidArgument);
        }
        self.send_message(id, payload)
    }

    /// Current device state
    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    /// Changes the device state, notifying the host if it changed
    ///
    /// The state is updated even when the notification can't be queued.
    pub fn set_device_state_notification(&mut self, state: DeviceState) -> Result<(), Error> {
        if self.device_state == state {
            return Ok(());
        }
        self.device_state = state;
        info!("device state {:?}", state);
        self.notify_device_state()
    }

    /// Forces the device back to `Ready` and notifies the host
    pub fn reset_device_state(&mut self) -> Result<(), Error> {
        self.device_state = DeviceState::Ready;
        info!("device state reset");
        self.notify_device_state()
    }

    fn notify_device_state(&mut self) -> Result<(), Error> {
        if !self.is_server() {
            return Ok(());
        }
        let id = MessageId::notification(gid::CORE, core_oid::DEVICE_STATUS_NTF);
        self.send_bytes(id, &[self.device_state as u8])
    }

    /// Reports a failure not tied to a command with `CORE_GENERIC_ERROR_NTF`
    pub fn send_generic_error(&mut self, status: Status) -> Result<(), Error> {
        let id = MessageId::notification(gid::CORE, core_oid::GENERIC_ERROR_NTF);
        self.send_bytes(id, &[status as u8])
    }
}

/// Entry point to the UCI engine
pub struct Uci {
    core: UciCore,
    registry: Registry,
    rx: Reassembler,
}

impl Uci {
    /// Creates a context, `config` must be valid
    pub fn new<A: Allocator + 'static>(config: UciConfig, allocator: A) -> Result<Self, Error> {
        config.validate()?;
        Ok(Uci {
            core: UciCore::new(config, Box::new(allocator)),
            registry: Registry::default(),
            rx: Reassembler::new(),
        })
    }

    /// Tears the context down, detaching the transport
    ///
    /// Queued packets and any partial message are released.
    pub fn uninit(mut self) -> Option<Box<dyn Transport>> {
        self.transport_detach().ok()
    }

    /// State shared with handlers
    pub fn core(&mut self) -> &mut UciCore {
        &mut self.core
    }

    /// Registers a batch of handlers serving one group
    ///
    /// A batch that is empty, mixes groups or lists an id twice is rejected
    /// as a whole.
    pub fn register_handlers<T: Send + 'static>(
        &mut self,
        handlers: MessageHandlers<T>,
    ) -> Result<HandlerToken, Error> {
        self.registry.register(handlers)
    }

    /// Removes a batch registered earlier
    pub fn unregister_handlers(&mut self, token: HandlerToken) -> Result<(), Error> {
        self.registry.unregister(token)
    }

    /// Attaches the transport, only one may be attached at a time
    pub fn transport_attach(&mut self, mut transport: Box<dyn Transport>) -> Result<(), Error> {
        if self.core.transport.is_some() {
            return Err(Error::Busy);
        }
        transport.attach();
        self.core.transport = Some(transport);
        if !self.core.tx.is_empty() {
            self.core.signal_send_ready();
        }
        Ok(())
    }

    /// Detaches and returns the transport
    pub fn transport_detach(&mut self) -> Result<Box<dyn Transport>, Error> {
        let mut transport = self.core.transport.take().ok_or(Error::InvalidArgument)?;
        transport.detach();
        Ok(transport)
    }

    /// Allocates a block to receive one packet of `size` bytes
    ///
    /// On exhaustion the message being reassembled is dropped, since it can
    /// no longer complete, and the rest of its segments will be skipped. The
    /// caller should then pass the header of the lost packet to
    /// [`Uci::packet_recv_dropped`].
    pub fn packet_recv_alloc(&mut self, size: usize) -> Option<Block> {
        let block = self.core.alloc(size, BlockFlags::NONE);
        if block.is_none() {
            if let Some(id) = self.rx.pending_id() {
                warn!("no memory for segment of message {}", id.raw());
                self.rx.skip_rest(id);
                self.reject(id, &Error::NoMemory);
            }
        }
        block
    }

    /// Notes a packet that was read but could not be stored
    ///
    /// A lost segment makes the engine skip the rest of its message. A lost
    /// command is answered with `FAILED`, once.
    pub fn packet_recv_dropped(&mut self, header: &PacketHeader) {
        if self.rx.skips(header) {
            return;
        }
        warn!("packet of message {} lost", header.id().raw());
        self.rx.abandon(header);
        self.reject(header.id(), &Error::NoMemory);
    }

    /// Takes a received packet, header included
    ///
    /// Completed messages are dispatched before returning. A malformed
    /// command is answered with an error status. Packets of a message whose
    /// earlier segment was refused are dropped without a word.
    pub fn packet_recv(&mut self, mut packet: Block) -> Result<(), Error> {
        let header = match PacketHeader::decode(packet.data()) {
            Ok(header) => header,
            Err(error) => {
                warn!("undecodable packet header");
                self.rx.discard();
                return Err(error);
            }
        };

        if self.rx.skips(&header) {
            self.core.allocator.free(packet);
            return Ok(());
        }

        let len = header.payload_len as usize;
        let max = self.core.max_payload(header.mt);
        let actual = packet.chain_len() - HEADER_LEN;
        let checked = if len > max {
            Err(Error::PayloadTooLarge { len, max })
        } else if len != actual {
            Err(Error::LengthMismatch {
                expected: len,
                actual,
            })
        } else {
            packet.pull_front(HEADER_LEN)
        };
        if let Err(error) = checked {
            self.rx.abandon(&header);
            self.reject(header.id(), &error);
            return Err(error);
        }

        match self.rx.push(header, packet) {
            Ok(Reassembly::Pending) => Ok(()),
            Ok(Reassembly::Complete(message)) => {
                self.dispatch(message.id, message.payload);
                Ok(())
            }
            Err(error) => {
                self.reject(header.id(), &error);
                Err(error)
            }
        }
    }

    /// Copies a received packet into a block and takes it
    pub fn packet_recv_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let Some(mut packet) = self.packet_recv_alloc(bytes.len()) else {
            if let Ok(header) = PacketHeader::decode(bytes) {
                self.packet_recv_dropped(&header);
            }
            return Err(Error::NoMemory);
        };
        packet.put(bytes)?;
        self.packet_recv(packet)
    }

    fn reject(&mut self, id: MessageId, error: &Error) {
        let sent = if id.mt().is_command() {
            self.core.send_status(id, error.status())
        } else if id.mt() == MessageType::Data && self.core.is_server() {
            self.core.send_generic_error(error.status())
        } else {
            Ok(())
        };
        if let Err(error) = sent {
            warn!("could not report rejected message: {:?}", error);
        }
    }

    fn dispatch(&mut self, id: MessageId, payload: Option<Block>) {
        let core = &mut self.core;

        let answered = core.awaiting.map(|cmd| cmd.to_response()) == Some(id);
        if answered {
            core.awaiting = None;
            if !core.tx.is_empty() {
                core.signal_send_ready();
            }
        }

        let is_command = id.mt().is_command();
        if is_command {
            core.current_command = Some(id);
            core.responded = false;
        }

        let result = self.registry.dispatch(core, id, payload);

        let responded = core.responded;
        core.current_command = None;
        core.responded = false;

        if let Err(error) = result {
            if is_command && !responded {
                let status = match error {
                    Error::Status(status) => status,
                    _ => Status::FAILED,
                };
                if let Err(error) = core.send_status(id, status) {
                    warn!("could not send status for {}: {:?}", id.raw(), error);
                }
            } else {
                debug!("message {} not handled: {:?}", id.raw(), error);
            }
        }
    }

    /// Lends the next packet to send
    ///
    /// Returns `None` when nothing can be sent or a packet is already on
    /// loan. In client mode, commands are held back while another command
    /// awaits its response.
    pub fn packet_send_get_ready(&mut self) -> Option<Block> {
        let core = &mut self.core;
        if core.loaned {
            warn!("packet requested while another one is on loan");
            return None;
        }

        let index = if core.awaiting.is_some() {
            core.tx.iter().position(|packet| {
                PacketHeader::decode(packet.data()).map_or(true, |h| !h.mt.is_command())
            })?
        } else {
            0
        };
        let packet = core.tx.remove(index)?;

        if !core.is_server() {
            if let Ok(header) = PacketHeader::decode(packet.data()) {
                if header.mt.is_command() && !header.is_segment() {
                    core.awaiting = Some(header.id());
                }
            }
        }

        core.loaned = true;
        Some(packet)
    }

    /// Returns a packet lent by [`Uci::packet_send_get_ready`]
    pub fn packet_send_done(&mut self, packet: Block, result: Result<(), Error>) {
        let core = &mut self.core;
        if !core.loaned {
            warn!("packet returned without a loan");
        }
        core.loaned = false;
        if let Err(error) = result {
            warn!("packet send failed: {:?}", error);
        }

        core.allocator.free(packet);
        core.refill_reserve();

        if !core.tx.is_empty() {
            core.signal_send_ready();
        }
    }

    /// Gives up waiting for the response of the outstanding command
    ///
    /// The transport calls this when its response timer fires. Returns the
    /// expired command, if any. Only meaningful in client mode.
    pub fn packet_response_expire(&mut self) -> Option<MessageId> {
        let expired = self.core.awaiting.take()?;
        warn!("response to {} expired", expired.raw());
        if !self.core.tx.is_empty() {
            self.core.signal_send_ready();
        }
        Some(expired)
    }
}

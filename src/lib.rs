//! Engine for the UWB Command Interface (UCI)
//!
//! This crate implements the protocol layer that sits between a UCI transport
//! (SPI, UART, USB, ...) and the ranging backends of a UWB subsystem: packet
//! framing, segmentation and reassembly, message dispatch by
//! (message type, group id, opcode id), the device state machine and the
//! session manager that multiplexes FiRa, CCC, PCTT and radar sessions.
//!
//! The entry point is [`Uci`]. A transport hands received packets to
//! [`Uci::packet_recv`] and borrows packets to transmit with
//! [`Uci::packet_send_get_ready`] / [`Uci::packet_send_done`]. Message
//! handlers are registered in batches with [`Uci::register_handlers`]; the
//! session manager in [`session`] is itself such a batch.
//!
//! ## Concurrency model
//!
//! A [`Uci`] context is driven from at most two execution contexts, the
//! transport's receive path and its send path. All methods take `&mut self`,
//! so the integrator serializes them, typically by wrapping the context in a
//! mutex. Handlers run with the context borrowed and must not re-enter it.
//!
//! Payload memory comes from a pluggable [`block::Allocator`]. Blocks move by
//! value through the engine: a block is owned by exactly one queue, handler or
//! transport at any time.
//!
//! [`Uci`]: uci::Uci
//! [`Uci::packet_recv`]: uci::Uci::packet_recv
//! [`Uci::packet_send_get_ready`]: uci::Uci::packet_send_get_ready
//! [`Uci::packet_send_done`]: uci::Uci::packet_send_done
//! [`Uci::register_handlers`]: uci::Uci::register_handlers
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(feature = "async")]
use maybe_async::must_be_async as maybe_async_attr;
#[cfg(not(feature = "async"))]
use maybe_async::must_be_sync as maybe_async_attr;

#[cfg(not(feature = "async"))]
use embedded_hal as spi_type;
#[cfg(feature = "async")]
use embedded_hal_async as spi_type;

#[macro_use]
mod fmt;

pub mod block;
pub mod configs;
pub mod link;
pub mod message;
pub mod packet;
pub mod session;
pub mod status;
pub mod uci;

pub use crate::{
    block::{Allocator, Block, BlockFlags, HeapAllocator, PoolAllocator},
    configs::{DeviceInfo, Mode, UciConfig},
    link::{LinkError, SpiLink},
    message::{MessageReader, MessageWriter},
    packet::{MessageId, MessageType, PacketBoundary, PacketHeader},
    session::{BackendManager, BackendManagerHandle, SessionController, SessionType},
    status::Status,
    uci::{DeviceState, Error, HandlerToken, MessageHandlers, Transport, Uci, UciCore},
};

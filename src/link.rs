//! UCI transport over an SPI device
//!
//! Each packet travels in its own SPI transaction. On receive the 4-byte
//! header is read first, which gives the length of the payload read in a
//! second transaction.

use alloc::vec::Vec;
use core::fmt;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{
    maybe_async_attr,
    packet::{PacketHeader, HEADER_LEN},
    spi_type,
    uci::{Error, Uci},
};
use spi_type::spi::{self, Operation};

/// Scratch size used to flush a payload nobody could store
const DISCARD_CHUNK: usize = 32;

/// Moves packets between a [`Uci`] context and an SPI device
pub struct SpiLink<SPI> {
    spi: SPI,
}

impl<SPI> SpiLink<SPI>
where
    SPI: spi_type::spi::SpiDevice<u8>,
{
    pub fn new(spi: SPI) -> Self {
        SpiLink { spi }
    }

    /// Releases the SPI device
    pub fn free(self) -> SPI {
        self.spi
    }

    /// Reads one packet from the device and hands it to `uci`
    ///
    /// A payload that can't be allocated is still clocked out of the device,
    /// so the next read starts on a header, and `uci` is told of the loss.
    #[maybe_async_attr]
    pub async fn receive(&mut self, uci: &mut Uci) -> Result<(), LinkError<SPI::Error>> {
        let mut header = [0; HEADER_LEN];
        self.spi.read(&mut header).await.map_err(LinkError::Spi)?;
        let decoded = PacketHeader::decode(&header)?;
        let len = decoded.payload_len as usize;
        trace!("packet header {:?}, {} payload bytes", header, len);

        let mut packet = match uci.packet_recv_alloc(HEADER_LEN + len) {
            Some(packet) => packet,
            None => {
                self.discard(len).await?;
                uci.packet_recv_dropped(&decoded);
                return Err(LinkError::Uci(Error::NoMemory));
            }
        };
        packet.put(&header)?;
        if len > 0 {
            let payload = packet.push_back(len).ok_or(Error::NoMemory)?;
            self.spi.read(payload).await.map_err(LinkError::Spi)?;
        }

        uci.packet_recv(packet)?;
        Ok(())
    }

    #[maybe_async_attr]
    async fn discard(&mut self, mut len: usize) -> Result<(), LinkError<SPI::Error>> {
        let mut scratch = [0; DISCARD_CHUNK];
        while len > 0 {
            let chunk = len.min(DISCARD_CHUNK);
            self.spi
                .read(&mut scratch[..chunk])
                .await
                .map_err(LinkError::Spi)?;
            len -= chunk;
        }
        Ok(())
    }

    /// Writes the next packet queued in `uci`
    ///
    /// Returns `WouldBlock` when there is nothing to send. The packet is
    /// handed back to `uci` whatever the outcome.
    #[maybe_async_attr]
    pub async fn transmit(&mut self, uci: &mut Uci) -> nb::Result<(), LinkError<SPI::Error>> {
        let packet = uci.packet_send_get_ready().ok_or(nb::Error::WouldBlock)?;

        let mut operations: Vec<Operation<'_, u8>> =
            packet.iter().map(|block| Operation::Write(block.data())).collect();
        let result = self.spi.transaction(&mut operations).await;
        drop(operations);

        match result {
            Ok(()) => {
                uci.packet_send_done(packet, Ok(()));
                Ok(())
            }
            Err(error) => {
                uci.packet_send_done(packet, Err(Error::Transport));
                Err(nb::Error::Other(LinkError::Spi(error)))
            }
        }
    }
}

/// An error that can occur while moving packets over SPI
pub enum LinkError<E> {
    /// Error occured while using SPI bus
    Spi(E),

    /// The engine refused the packet
    Uci(Error),
}

impl<E> From<Error> for LinkError<E> {
    fn from(error: Error) -> Self {
        LinkError::Uci(error)
    }
}

impl<E: fmt::Debug> fmt::Display for LinkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl<E: fmt::Debug> std::error::Error for LinkError<E> {}

// We can't derive this implementation, as `Debug` is only implemented
// conditionally for the bus error.
impl<E: fmt::Debug> fmt::Debug for LinkError<E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::Spi(error) => write!(f, "Spi({:?})", error),
            LinkError::Uci(error) => write!(f, "Uci({:?})", error),
        }
    }
}

#[cfg(feature = "defmt")]
impl<E: spi::Error> Format for LinkError<E> {
    fn format(&self, f: defmt::Formatter) {
        match self {
            LinkError::Spi(error) => {
                defmt::write!(f, "Spi({:?})", defmt::Debug2Format(&error.kind()))
            }
            LinkError::Uci(error) => defmt::write!(f, "Uci({:?})", error),
        }
    }
}

impl<E: spi::Error> LinkError<E> {
    /// Kind of the bus error, if the bus failed
    pub fn spi_kind(&self) -> Option<spi::ErrorKind> {
        match self {
            LinkError::Spi(error) => Some(error.kind()),
            LinkError::Uci(_) => None,
        }
    }
}

//! Readers and writers for message payloads
//!
//! A reassembled payload may span several blocks. [`MessageReader`] walks a
//! block chain as if it were one contiguous buffer. [`MessageWriter`] builds a
//! payload that is then moved into a header-reserved block for sending.

use alloc::vec::Vec;

use byte::{
    ctx::{Endian, LE},
    BytesExt as _, TryWrite,
};

use crate::{
    block::{Allocator, Block, BlockFlags},
    Error,
};

/// Sequential little-endian reader over a block chain
#[derive(Clone)]
pub struct MessageReader<'a> {
    cur: &'a [u8],
    rest: Option<&'a Block>,
}

impl<'a> MessageReader<'a> {
    /// Reads the data of `payload` and every block chained to it
    pub fn new(payload: Option<&'a Block>) -> Self {
        MessageReader {
            cur: &[],
            rest: payload,
        }
    }

    /// Reads a plain byte slice
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        MessageReader {
            cur: bytes,
            rest: None,
        }
    }

    fn fill(&mut self) {
        while self.cur.is_empty() {
            match self.rest {
                Some(block) => {
                    self.cur = block.data();
                    self.rest = block.next();
                }
                None => break,
            }
        }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.cur.len() + self.rest.map_or(0, Block::chain_len)
    }

    /// Fills `out` entirely or fails without a partial guarantee
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < out.len() {
            self.fill();
            let take = (out.len() - filled).min(self.cur.len());
            if take == 0 {
                return Err(Error::Frame(byte::Error::Incomplete));
            }
            out[filled..filled + take].copy_from_slice(&self.cur[..take]);
            self.cur = &self.cur[take..];
            filled += take;
        }
        Ok(())
    }

    /// Moves `len` bytes into the tailroom of `dst`
    pub fn copy_into(&mut self, dst: &mut Block, len: usize) -> Result<(), Error> {
        let mut left = len;
        while left > 0 {
            self.fill();
            let take = left.min(self.cur.len());
            if take == 0 {
                return Err(Error::Frame(byte::Error::Incomplete));
            }
            dst.put(&self.cur[..take])?;
            self.cur = &self.cur[take..];
            left -= take;
        }
        Ok(())
    }

    /// Skips `len` bytes
    pub fn skip(&mut self, len: usize) -> Result<(), Error> {
        let mut left = len;
        while left > 0 {
            self.fill();
            let take = left.min(self.cur.len());
            if take == 0 {
                return Err(Error::Frame(byte::Error::Incomplete));
            }
            self.cur = &self.cur[take..];
            left -= take;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        let mut buf = [0; 1];
        self.read_into(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        let mut buf = [0; 2];
        self.read_into(&mut buf)?;
        Ok(buf.read_with::<u16>(&mut 0, LE)?)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.read_into(&mut buf)?;
        Ok(buf.read_with::<u32>(&mut 0, LE)?)
    }

    pub fn read_u64_le(&mut self) -> Result<u64, Error> {
        let mut buf = [0; 8];
        self.read_into(&mut buf)?;
        Ok(buf.read_with::<u64>(&mut 0, LE)?)
    }

    /// Reads `len` bytes into a new vector
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len > self.remaining() {
            return Err(Error::Frame(byte::Error::Incomplete));
        }
        let mut out = alloc::vec![0; len];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Reads everything left
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining());
        loop {
            self.fill();
            if self.cur.is_empty() {
                break;
            }
            out.extend_from_slice(self.cur);
            self.cur = &[];
        }
        out
    }
}

/// Little-endian payload builder
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        MessageWriter::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16_le(&mut self, value: u16) -> &mut Self {
        self.put_le(value)
    }

    pub fn put_u32_le(&mut self, value: u32) -> &mut Self {
        self.put_le(value)
    }

    pub fn put_u64_le(&mut self, value: u64) -> &mut Self {
        self.put_le(value)
    }

    fn put_le<T: TryWrite<Endian>>(&mut self, value: T) -> &mut Self {
        let mut offset = self.buf.len();
        self.buf.resize(offset + core::mem::size_of::<T>(), 0);
        // the buffer was just grown by the size of `T`
        let written = self.buf.as_mut_slice().write_with(&mut offset, value, LE);
        debug_assert!(written.is_ok());
        self
    }

    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Overwrites an already written byte, used for counters known late
    pub fn patch_u8(&mut self, at: usize, value: u8) -> Result<(), Error> {
        let slot = self.buf.get_mut(at).ok_or(Error::InvalidArgument)?;
        *slot = value;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Copies the payload into one header-reserved block
    ///
    /// Returns `Ok(None)` for an empty payload.
    pub fn to_block(&self, allocator: &dyn Allocator) -> Result<Option<Block>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut block = allocator
            .alloc(self.buf.len(), BlockFlags::HEADER_RESERVED)
            .ok_or(Error::NoMemory)?;
        block.put(&self.buf)?;
        Ok(Some(block))
    }
}

//! Binary-protocol reader over an in-memory buffer.
//!
//! Length prefixes of strings and containers are checked against the bytes
//! left in the buffer before anything is allocated, so a corrupt
//! `topology.ser` fails with an error instead of exhausting memory.

use thrift::protocol::{
    TBinaryInputProtocol, TFieldIdentifier, TInputProtocol, TListIdentifier, TMapIdentifier,
    TMessageIdentifier, TSetIdentifier, TStructIdentifier,
};
use thrift::{ProtocolError, ProtocolErrorKind};

/// Strict binary protocol reading from a byte slice
#[derive(Debug)]
pub struct SliceInput<'a> {
    inner: TBinaryInputProtocol<&'a [u8]>,
}

impl<'a> SliceInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            inner: TBinaryInputProtocol::new(bytes, true),
        }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.inner.transport.len()
    }

    fn checked_len(&self, declared: i32, what: &str) -> thrift::Result<usize> {
        let remaining = self.remaining();
        match usize::try_from(declared) {
            Ok(len) if len <= remaining => Ok(len),
            Err(_) => Err(thrift::Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::NegativeSize,
                format!("{} declares negative size {}", what, declared),
            ))),
            Ok(_) => Err(thrift::Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::SizeLimit,
                format!(
                    "{} declares size {} with {} bytes left",
                    what, declared, remaining
                ),
            ))),
        }
    }
}

impl<'a> TInputProtocol for SliceInput<'a> {
    fn read_message_begin(&mut self) -> thrift::Result<TMessageIdentifier> {
        self.inner.read_message_begin()
    }

    fn read_message_end(&mut self) -> thrift::Result<()> {
        self.inner.read_message_end()
    }

    fn read_struct_begin(&mut self) -> thrift::Result<Option<TStructIdentifier>> {
        self.inner.read_struct_begin()
    }

    fn read_struct_end(&mut self) -> thrift::Result<()> {
        self.inner.read_struct_end()
    }

    fn read_field_begin(&mut self) -> thrift::Result<TFieldIdentifier> {
        self.inner.read_field_begin()
    }

    fn read_field_end(&mut self) -> thrift::Result<()> {
        self.inner.read_field_end()
    }

    fn read_bool(&mut self) -> thrift::Result<bool> {
        self.inner.read_bool()
    }

    fn read_bytes(&mut self) -> thrift::Result<Vec<u8>> {
        let declared = self.inner.read_i32()?;
        let len = self.checked_len(declared, "binary field")?;
        let data: &'a [u8] = self.inner.transport;
        let (head, rest) = data.split_at(len);
        self.inner.transport = rest;
        Ok(head.to_vec())
    }

    fn read_i8(&mut self) -> thrift::Result<i8> {
        self.inner.read_i8()
    }

    fn read_i16(&mut self) -> thrift::Result<i16> {
        self.inner.read_i16()
    }

    fn read_i32(&mut self) -> thrift::Result<i32> {
        self.inner.read_i32()
    }

    fn read_i64(&mut self) -> thrift::Result<i64> {
        self.inner.read_i64()
    }

    fn read_double(&mut self) -> thrift::Result<f64> {
        self.inner.read_double()
    }

    fn read_string(&mut self) -> thrift::Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(From::from)
    }

    fn read_list_begin(&mut self) -> thrift::Result<TListIdentifier> {
        let ident = self.inner.read_list_begin()?;
        self.checked_len(ident.size, "list")?;
        Ok(ident)
    }

    fn read_list_end(&mut self) -> thrift::Result<()> {
        self.inner.read_list_end()
    }

    fn read_set_begin(&mut self) -> thrift::Result<TSetIdentifier> {
        let ident = self.inner.read_set_begin()?;
        self.checked_len(ident.size, "set")?;
        Ok(ident)
    }

    fn read_set_end(&mut self) -> thrift::Result<()> {
        self.inner.read_set_end()
    }

    fn read_map_begin(&mut self) -> thrift::Result<TMapIdentifier> {
        let ident = self.inner.read_map_begin()?;
        self.checked_len(ident.size, "map")?;
        Ok(ident)
    }

    fn read_map_end(&mut self) -> thrift::Result<()> {
        self.inner.read_map_end()
    }

    fn read_byte(&mut self) -> thrift::Result<u8> {
        self.inner.read_byte()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reads_and_tracks_remaining() {
        let bytes = [0u8, 0, 0, 2, b'h', b'i', 9];
        let mut input = SliceInput::new(&bytes);
        assert_eq!(input.read_string().unwrap(), "hi");
        assert_eq!(input.remaining(), 1);
    }

    #[test]
    fn test_oversized_string_rejected() {
        let bytes = [0x7fu8, 0xff, 0xff, 0xff, b'a'];
        let mut input = SliceInput::new(&bytes);
        assert!(input.read_string().is_err());
    }

    #[test]
    fn test_negative_string_length_rejected() {
        let bytes = [0xffu8, 0xff, 0xff, 0xff];
        let mut input = SliceInput::new(&bytes);
        assert!(input.read_bytes().is_err());
    }

    #[test]
    fn test_oversized_list_rejected() {
        let bytes = [11u8, 0x7f, 0xff, 0xff, 0xff, 0, 0];
        let mut input = SliceInput::new(&bytes);
        assert!(input.read_list_begin().is_err());
    }

    #[test]
    fn test_oversized_map_rejected() {
        let bytes = [11u8, 12, 0, 1, 0, 0];
        let mut input = SliceInput::new(&bytes);
        assert!(input.read_map_begin().is_err());
    }
}

//! Binary buffer management for PostgreSQL protocol handling
//!
//! Provides position-tracking readers and writers over byte slices with
//! network byte order (big-endian) handling, as used by the replication
//! frame and pgoutput decoders and the standby status encoder.

use crate::core::errors::{MessagingError, MessagingResult};

/// A buffer reader that manages position and provides meaningful parsing methods
#[derive(Debug)]
pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Create a new buffer reader from a byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Read a single byte at current position
    pub fn read_u8(&mut self) -> MessagingResult<u8> {
        if !self.has_bytes(1) {
            return Err(MessagingError::decode("Not enough bytes for u8"));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Read the message tag byte at current position
    pub fn read_tag(&mut self) -> MessagingResult<char> {
        if !self.has_bytes(1) {
            return Err(MessagingError::decode(
                "Empty buffer or not enough bytes for message tag",
            ));
        }
        let tag = self.buffer[self.position] as char;
        self.position += 1;
        Ok(tag)
    }

    /// Read a 16-bit signed integer at current position
    pub fn read_i16(&mut self) -> MessagingResult<i16> {
        if !self.has_bytes(2) {
            return Err(MessagingError::decode("Not enough bytes for i16"));
        }
        let value = i16::from_be_bytes(
            self.buffer[self.position..self.position + 2]
                .try_into()
                .expect("length checked"),
        );
        self.position += 2;
        Ok(value)
    }

    /// Read a 32-bit unsigned integer at current position
    pub fn read_u32(&mut self) -> MessagingResult<u32> {
        if !self.has_bytes(4) {
            return Err(MessagingError::decode("Not enough bytes for u32"));
        }
        let value = u32::from_be_bytes(
            self.buffer[self.position..self.position + 4]
                .try_into()
                .expect("length checked"),
        );
        self.position += 4;
        Ok(value)
    }

    /// Read a 32-bit signed integer at current position
    pub fn read_i32(&mut self) -> MessagingResult<i32> {
        if !self.has_bytes(4) {
            return Err(MessagingError::decode("Not enough bytes for i32"));
        }
        let value = i32::from_be_bytes(
            self.buffer[self.position..self.position + 4]
                .try_into()
                .expect("length checked"),
        );
        self.position += 4;
        Ok(value)
    }

    /// Read a 64-bit unsigned integer at current position
    pub fn read_u64(&mut self) -> MessagingResult<u64> {
        if !self.has_bytes(8) {
            return Err(MessagingError::decode("Not enough bytes for u64"));
        }
        let value = u64::from_be_bytes(
            self.buffer[self.position..self.position + 8]
                .try_into()
                .expect("length checked"),
        );
        self.position += 8;
        Ok(value)
    }

    /// Read a 64-bit signed integer at current position
    pub fn read_i64(&mut self) -> MessagingResult<i64> {
        if !self.has_bytes(8) {
            return Err(MessagingError::decode("Not enough bytes for i64"));
        }
        let value = i64::from_be_bytes(
            self.buffer[self.position..self.position + 8]
                .try_into()
                .expect("length checked"),
        );
        self.position += 8;
        Ok(value)
    }

    /// Read a null-terminated string at current position
    pub fn read_null_terminated_string(&mut self) -> MessagingResult<String> {
        let start_pos = self.position;

        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }

        if self.position >= self.buffer.len() {
            return Err(MessagingError::decode("String not null-terminated"));
        }

        let string_bytes = &self.buffer[start_pos..self.position];
        let string_value = String::from_utf8_lossy(string_bytes).into_owned();

        // Skip the null terminator
        self.position += 1;

        Ok(string_value)
    }

    /// Read exactly `count` bytes at current position
    pub fn read_bytes(&mut self, count: usize) -> MessagingResult<&'a [u8]> {
        if !self.has_bytes(count) {
            return Err(MessagingError::decode("Not enough bytes"));
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    /// The rest of the buffer from the current position
    pub fn rest(&self) -> &'a [u8] {
        &self.buffer[self.position..]
    }

    /// Peek at the next byte without advancing position
    pub fn peek_u8(&self) -> MessagingResult<u8> {
        if !self.has_bytes(1) {
            return Err(MessagingError::decode("No bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }
}

/// A buffer writer that manages position and provides meaningful writing methods
/// for constructing binary messages with automatic position tracking
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    /// Create a new buffer writer from a mutable byte slice
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get remaining space in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if we have at least `count` bytes remaining
    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    /// Write a single byte at current position
    pub fn write_u8(&mut self, value: u8) -> MessagingResult<()> {
        if !self.has_space(1) {
            return Err(MessagingError::protocol("Not enough space for u8"));
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    /// Write a 32-bit unsigned integer at current position
    pub fn write_u32(&mut self, value: u32) -> MessagingResult<()> {
        if !self.has_space(4) {
            return Err(MessagingError::protocol("Not enough space for u32"));
        }
        self.buffer[self.position..self.position + 4].copy_from_slice(&value.to_be_bytes());
        self.position += 4;
        Ok(())
    }

    /// Write a 64-bit unsigned integer at current position
    pub fn write_u64(&mut self, value: u64) -> MessagingResult<()> {
        if !self.has_space(8) {
            return Err(MessagingError::protocol("Not enough space for u64"));
        }
        self.buffer[self.position..self.position + 8].copy_from_slice(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }

    /// Write a 64-bit signed integer at current position
    pub fn write_i64(&mut self, value: i64) -> MessagingResult<()> {
        if !self.has_space(8) {
            return Err(MessagingError::protocol("Not enough space for i64"));
        }
        self.buffer[self.position..self.position + 8].copy_from_slice(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }

    /// Get the total bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_integers_in_network_order() {
        let data = [0x00, 0x00, 0x00, 0x2A, 0xFF, 0xFF];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert_eq!(reader.read_i16().unwrap(), -1);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn rejects_reads_past_the_end() {
        let data = [0x01];
        let mut reader = BufferReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert!(reader.read_u8().is_err());
        assert!(reader.read_u64().is_err());
    }

    #[test]
    fn reads_null_terminated_strings() {
        let data = b"public\0outbox\0";
        let mut reader = BufferReader::new(data);
        assert_eq!(reader.read_null_terminated_string().unwrap(), "public");
        assert_eq!(reader.read_null_terminated_string().unwrap(), "outbox");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let data = b"public";
        let mut reader = BufferReader::new(data);
        assert!(reader.read_null_terminated_string().is_err());
    }

    #[test]
    fn writer_tracks_position_and_bounds() {
        let mut buf = [0u8; 9];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_u8(b'r').unwrap();
        writer.write_u64(0x0102030405060708).unwrap();
        assert_eq!(writer.bytes_written(), 9);
        assert!(writer.write_u8(0).is_err());
        assert_eq!(buf[0], b'r');
        assert_eq!(buf[1..9], [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn round_trips_u64_through_reader() {
        let mut buf = [0u8; 8];
        BufferWriter::new(&mut buf).write_u64(987_654_321).unwrap();
        assert_eq!(BufferReader::new(&buf).read_u64().unwrap(), 987_654_321);
    }
}

use std::io::{self, Read, Write};

/// A growable linear byte buffer the io loop reads into and writes from.
///
/// Consumed bytes stay in front until `shift` compacts the buffer, so
/// `data()` is always a single contiguous slice for the frame parser.
pub(crate) struct Buffer {
    memory: Vec<u8>,
    position: usize,
    end: usize,
}

impl Buffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            memory: vec![0; capacity],
            position: 0,
            end: 0,
        }
    }

    pub(crate) fn grow(&mut self, new_size: usize) {
        if self.memory.len() < new_size {
            self.memory.resize(new_size, 0);
        }
    }

    pub(crate) fn available_data(&self) -> usize {
        self.end - self.position
    }

    pub(crate) fn available_space(&self) -> usize {
        self.memory.len() - self.end
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.memory[self.position..self.end]
    }

    pub(crate) fn space(&mut self) -> &mut [u8] {
        &mut self.memory[self.end..]
    }

    pub(crate) fn fill(&mut self, count: usize) {
        self.end += count;
    }

    pub(crate) fn consume(&mut self, count: usize) {
        self.position += count.min(self.available_data());
        if self.position == self.end {
            self.position = 0;
            self.end = 0;
        }
    }

    /// Move the pending data back to the front of the buffer
    pub(crate) fn shift(&mut self) {
        if self.position > 0 {
            self.memory.copy_within(self.position..self.end, 0);
            self.end -= self.position;
            self.position = 0;
        }
    }

    pub(crate) fn shift_unless_available(&mut self, size: usize) {
        if self.available_space() < size {
            self.shift();
        }
    }

    /// Append already serialized bytes, growing if needed
    pub(crate) fn extend(&mut self, data: &[u8]) {
        if self.available_space() < data.len() {
            self.shift();
        }
        if self.available_space() < data.len() {
            let needed = self.end + data.len();
            self.memory.resize(needed, 0);
        }
        self.memory[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }

    pub(crate) fn read_from<T: Read>(&mut self, reader: &mut T) -> io::Result<usize> {
        let count = reader.read(self.space())?;
        self.fill(count);
        Ok(count)
    }

    pub(crate) fn write_to<T: Write>(&mut self, writer: &mut T) -> io::Result<usize> {
        let count = writer.write(self.data())?;
        self.consume(count);
        Ok(count)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.memory.len())
            .field("position", &self.position)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_consume_and_shift() {
        let mut buffer = Buffer::with_capacity(8);
        buffer.space()[..4].copy_from_slice(b"abcd");
        buffer.fill(4);
        assert_eq!(buffer.data(), b"abcd");
        buffer.consume(2);
        assert_eq!(buffer.data(), b"cd");
        buffer.shift();
        assert_eq!(buffer.data(), b"cd");
        assert_eq!(buffer.available_space(), 6);
    }

    #[test]
    fn consuming_everything_rewinds() {
        let mut buffer = Buffer::with_capacity(4);
        buffer.space()[..3].copy_from_slice(b"xyz");
        buffer.fill(3);
        buffer.consume(3);
        assert_eq!(buffer.available_data(), 0);
        assert_eq!(buffer.available_space(), 4);
    }

    #[test]
    fn extend_grows_when_needed() {
        let mut buffer = Buffer::with_capacity(2);
        buffer.extend(b"hello");
        assert_eq!(buffer.data(), b"hello");
    }
}

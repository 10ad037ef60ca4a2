//! Growable byte builder for efficient string construction in host code.
//!
//! The bytes stay owned by the builder (invisible to the collector) until
//! `push` turns them into a String value on the stack and clears the
//! builder for reuse.

use crate::value::make_object_value;
use crate::vm::VM;

pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, text: &str) {
        self.append(text.as_bytes());
    }

    pub fn append_char(&mut self, c: char) {
        let mut encoded = [0u8; 4];
        self.append_str(c.encode_utf8(&mut encoded));
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        self.data.splice(0..0, bytes.iter().copied());
    }

    pub fn prepend_str(&mut self, text: &str) {
        self.prepend(text.as_bytes());
    }

    /// Keep the first `len` bytes.
    pub fn trunc(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Drop the first `len` bytes.
    pub fn cut(&mut self, len: usize) {
        self.data.drain(..len.min(self.data.len()));
    }

    pub fn replace_char(&mut self, start: usize, from: u8, to: u8) {
        for byte in self.data.iter_mut().skip(start) {
            if *byte == from {
                *byte = to;
            }
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Convert the contents into a String value on top of the stack and
    /// clear the builder.
    pub fn push(&mut self, vm: &mut VM) {
        let content = String::from_utf8_lossy(&self.data).into_owned();
        let string = vm.intern_string(&content);
        vm.push(make_object_value(string));
        self.data.clear();
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_bytes_in_order() {
        let mut buffer = Buffer::new();
        buffer.append_str("hello");
        buffer.append_char(' ');
        buffer.append_str("world");
        assert_eq!(buffer.len(), 11);
        buffer.prepend_str(">> ");
        buffer.trunc(8);
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn push_yields_string_and_clears() {
        let mut vm = VM::new();
        let mut buffer = Buffer::new();
        buffer.append_str("built");
        let before = vm.stack_size();
        buffer.push(&mut vm);
        assert_eq!(vm.stack_size(), before + 1);
        assert_eq!(vm.get_string(-1), Some("built"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn cut_and_replace() {
        let mut buffer = Buffer::new();
        buffer.append_str("a_b_c");
        buffer.replace_char(0, b'_', b'-');
        buffer.cut(2);
        assert_eq!(buffer.len(), 3);
    }
}

//! Delimiter-based message reassembly.

use std::mem;

/// In-band message delimiter.
pub const DELIMITER: char = '\0';

/// Buffers decoded chunks of one notify channel until a delimiter completes
/// a message.
///
/// At most one message is extracted per [`feed`](Self::feed): when a chunk
/// holds several delimiters, everything after the first one becomes the new
/// buffer content, delimiters included.
#[derive(Debug, Default, Clone)]
pub struct FrameAssembler {
   buffer: String,
}

impl FrameAssembler {
   pub const fn new() -> Self {
      Self {
         buffer: String::new(),
      }
   }

   /// Appends a decoded chunk, returning the completed message if the chunk
   /// contains a delimiter.
   pub fn feed(&mut self, chunk: &str) -> Option<String> {
      let Some((head, tail)) = chunk.split_once(DELIMITER) else {
         self.buffer.push_str(chunk);
         return None;
      };
      self.buffer.push_str(head);
      Some(mem::replace(&mut self.buffer, tail.to_owned()))
   }

   /// Bytes of the in-progress message.
   pub fn buffer(&self) -> &str {
      &self.buffer
   }

   pub fn is_empty(&self) -> bool {
      self.buffer.is_empty()
   }

   pub fn clear(&mut self) {
      self.buffer.clear();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_chunks_without_delimiter_accumulate() {
      let mut assembler = FrameAssembler::new();
      for chunk in ["{\"cmd", "Execd\":", "\"run\"", ""] {
         assert_eq!(assembler.feed(chunk), None);
      }
      assert_eq!(assembler.buffer(), "{\"cmdExecd\":\"run\"");
   }

   #[test]
   fn test_delimiter_splits_message_and_tail() {
      let mut assembler = FrameAssembler::new();
      assert_eq!(assembler.feed("abc\0def").as_deref(), Some("abc"));
      assert_eq!(assembler.buffer(), "def");
   }

   #[test]
   fn test_only_first_delimiter_is_honored() {
      let mut assembler = FrameAssembler::new();
      assert_eq!(assembler.feed("a\0b\0c").as_deref(), Some("a"));
      assert_eq!(assembler.buffer(), "b\0c");

      // The carried-over delimiter is plain content now; the next one
      // completes "b\0c" plus whatever came before it.
      assert_eq!(assembler.feed("d\0").as_deref(), Some("b\0cd"));
      assert!(assembler.is_empty());
   }

   #[test]
   fn test_message_spans_chunks() {
      let mut assembler = FrameAssembler::new();
      assert_eq!(assembler.feed("{\"a\":1"), None);
      assert_eq!(assembler.feed("}\0").as_deref(), Some("{\"a\":1}"));
      assert!(assembler.is_empty());
   }

   #[test]
   fn test_lone_delimiter_emits_empty_message() {
      let mut assembler = FrameAssembler::new();
      assert_eq!(assembler.feed("\0").as_deref(), Some(""));
   }

   #[test]
   fn test_clear_drops_partial_message() {
      let mut assembler = FrameAssembler::new();
      assembler.feed("{\"stale\":");
      assembler.clear();
      assert_eq!(assembler.feed("{}\0").as_deref(), Some("{}"));
   }
}

//! Text encoding for channel payloads.
//!
//! Each notification packet is decoded on its own; there is no byte-level
//! reassembly before decoding, so a multi-byte character split across two
//! packets decodes to replacement characters under UTF-8.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Text encoding agreed with the robot firmware.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TextEncoding {
   #[default]
   Utf8,
   /// One byte per character, as older firmware consoles emit.
   Latin1,
}

/// Stateless byte/text converter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
   encoding: TextEncoding,
}

impl Codec {
   pub const fn new(encoding: TextEncoding) -> Self {
      Self { encoding }
   }

   pub const fn encoding(&self) -> TextEncoding {
      self.encoding
   }

   /// Encodes outgoing text. Characters outside Latin-1 become `?` under
   /// [`TextEncoding::Latin1`].
   pub fn encode(&self, text: &str) -> Vec<u8> {
      match self.encoding {
         TextEncoding::Utf8 => text.as_bytes().to_vec(),
         TextEncoding::Latin1 => text
            .chars()
            .map(|c| u8::try_from(c).unwrap_or(b'?'))
            .collect(),
      }
   }

   /// Decodes one notification packet.
   pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
      match self.encoding {
         TextEncoding::Utf8 => String::from_utf8_lossy(bytes),
         TextEncoding::Latin1 => Cow::Owned(bytes.iter().copied().map(char::from).collect()),
      }
   }
}

//! Tutti Protocol - session messages and page arrangement
//!
//! Everything two devices in a Tutti session agree on lives here:
//!
//! - **Roster**: the ordered device list; a device's index is its arrangement slot
//! - **Messages**: the five wire messages exchanged between leader and followers
//! - **Codec**: JSON encoding with a `type` tag, failing closed on anything unknown
//! - **Arrangement**: pure page arithmetic mapping the shared book page to each
//!   device's local page
//!
//! # Example
//!
//! ```
//! use tutti_protocol::{arrangement, codec, Direction, Message};
//!
//! let book = arrangement::advance(6, Direction::Next, 3);
//! assert_eq!(book, 9);
//!
//! let bytes = codec::encode(&Message::PageChanged { book_page: book }).unwrap();
//! assert_eq!(codec::decode(&bytes).unwrap(), Message::PageChanged { book_page: 9 });
//! ```

pub mod arrangement;
pub mod codec;
pub mod device;
pub mod error;
pub mod message;

pub use device::{Device, PeerId, Roster};
pub use error::{Error, Result};
pub use message::{BookPage, Direction, DocumentDescriptor, Message};

//! Client side of a socket relay protocol: an application creates sockets that are not bound to
//!  the local host, but are realized by one or more remote proxies. Each proxy the socket goes
//!  through is a *link*, and the socket spreads over all of its links: sends go to all of them,
//!  receives are merged.
//!
//! ## Architecture
//!
//! * Proxies are found through a [NameService](provider::name_service::NameService)
//! * Linking, socket options and unlinking are request / response exchanges over a control
//!    channel ([Remoting](provider::remoting::Remoting))
//! * Once a link is open, data flows through a separate stream provided by the
//!    [StreamService](provider::stream_service::StreamService). A link's stream has a send pump
//!    and a receive pump that add sequence numbers and keep the stream alive with `Poll`
//!    messages while idle.
//!
//! These three services are traits, and this crate does not implement them for any actual
//!  network. [test_util] has in-memory implementations for testing.
//!
//! ## Wire format
//!
//! All integers are big endian. Every message has the following envelope:
//!
//! ```ascii
//!  0: envelope version (u16)
//!  2: source reference (16 bytes)
//! 18: proxy reference (16 bytes)
//! 34: target reference (16 bytes)
//! 50: error code (i32) - 0 for success
//! 54: is_response (u8) - 0 or 1
//! 55: type id (u32)
//! 59: body (depending on type id and is_response)
//! ```
//!
//! Type ids are `0` (custom), `10` (ping), `12` (link), `13` (set option), `14` (get option),
//!  `20` (open), `21` (close), `30` (data) and `31` (poll). Unknown type ids are preserved as
//!  custom messages.
//!
//! Socket addresses start with the address family (u16), followed by the family's fields:
//!
//! ```ascii
//! Unspecified (0):    -
//! Unix (1):           path (varint length + UTF-8)
//! InterNetwork (2):   address (4 bytes), port (u16)
//! InterNetworkV6 (23): address (16 bytes), port (u16), flow info (u32), scope id (u32)
//! Proxy (28165):      host (varint length + UTF-8), port (u16), flags (u16), interface (i32)
//! ```
//!
//! A reference is its 16 raw bytes. It can be used as an IPv6 address, which is how references
//!  travel in address fields.

pub mod address;
pub mod browse;
pub mod config;
pub mod error;
pub mod link;
pub mod message;
pub mod provider;
pub mod reference;
pub mod socket;
pub mod socket_info;
pub mod stream;
pub mod test_util;
pub mod util;

//! ## Inter-process command framing
//!
//! Every message exchanged between the concentrator processes (supervisor,
//! security module, workers) travels over a unix SOCK_STREAM socket as one
//! frame:
//!
//! ```text
//! 0      1                5
//! +------+----------------+------------------------+
//! | cmd  | length (u32le) | length bytes of body   |
//! +------+----------------+------------------------+
//! ```
//!
//! The command byte selects a [`Command`] variant; the body, when present,
//! is a bincode-serialized message from [`message`]. The layout is wire
//! stable: the security module may outlive a supervisor reload, so neither
//! side may reorder or renumber anything here.
//!
//! Bodies can carry session identifiers and credentials, so packed buffers
//! are handed out as [`Zeroizing`] vectors and wiped when dropped.

pub mod command;
pub mod message;
pub mod safeid;

pub use self::command::Command;

use bytes::{Buf, BufMut};
use serde::{Serialize, de::DeserializeOwned};
use zeroize::Zeroizing;

/// `cmd` byte plus the little-endian body length.
pub const HEADER_SIZE: usize = 5;

/// Upper bound on a frame body. Anything larger is a protocol violation,
/// not a legitimate message.
pub const MAX_BODY_SIZE: usize = 256 * 1024;

#[derive(Debug)]
pub enum Error {
    Oversize,
    UnknownCommand(u8),
    Codec(bincode::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<bincode::Error> for Error {
    fn from(value: bincode::Error) -> Self {
        Self::Codec(value)
    }
}

/// Encode a frame header.
///
/// # Test
///
/// ```
/// use vpn_server_codec::{Command, encode_header};
///
/// let hdr = encode_header(Command::AuthCookieReq, 16);
///
/// assert_eq!(&hdr, &[1, 16, 0, 0, 0]);
/// ```
pub fn encode_header(cmd: Command, length: u32) -> [u8; HEADER_SIZE] {
    let mut hdr = [0u8; HEADER_SIZE];
    hdr[0] = cmd.into();
    (&mut hdr[1..]).put_u32_le(length);
    hdr
}

/// Decode a frame header into the command and the body length.
///
/// # Test
///
/// ```
/// use vpn_server_codec::{Command, decode_header, encode_header, Error};
///
/// let hdr = encode_header(Command::Terminate, 0);
/// assert_eq!(decode_header(&hdr).unwrap(), (Command::Terminate, 0));
///
/// assert!(matches!(
///     decode_header(&[0xff, 0, 0, 0, 0]),
///     Err(Error::UnknownCommand(0xff))
/// ));
/// ```
pub fn decode_header(hdr: &[u8; HEADER_SIZE]) -> Result<(Command, usize), Error> {
    let cmd = Command::try_from(hdr[0])?;
    let length = (&hdr[1..]).get_u32_le() as usize;
    if length > MAX_BODY_SIZE {
        return Err(Error::Oversize);
    }

    Ok((cmd, length))
}

/// Serialize a message body. The returned buffer is zeroed on drop since
/// bodies may contain session identifiers or credentials.
pub fn pack<T: Serialize>(msg: &T) -> Result<Zeroizing<Vec<u8>>, Error> {
    let packed = Zeroizing::new(bincode::serialize(msg)?);
    if packed.len() > MAX_BODY_SIZE {
        return Err(Error::Oversize);
    }

    Ok(packed)
}

/// Deserialize a message body.
///
/// # Test
///
/// ```
/// use vpn_server_codec::{message::TunMtu, pack, unpack};
///
/// let msg = TunMtu { mtu: 1400 };
/// let body = pack(&msg).unwrap();
///
/// assert_eq!(unpack::<TunMtu>(&body).unwrap(), msg);
/// ```
pub fn unpack<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    Ok(bincode::deserialize(body)?)
}

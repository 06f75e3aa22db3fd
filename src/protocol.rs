//! Wire protocol between the daemon and its PAM clients.
//!
//! Every message is a single 32-bit little-endian word sent as one
//! SEQPACKET datagram. The low [`MSG_TYPE_BITS`] bits carry the message
//! type, the upper bits carry auxiliary payload (a UID, a length, or a
//! chunk of string data).
//!
//! The runtime directory path is transferred tail-first: the client asks
//! for the total length, then repeatedly requests the remaining `R` bytes
//! and receives `min(R, 3)` bytes per reply, packed little-endian into the
//! aux bits. A 4-bit tag leaves 28 aux bits, so three whole bytes is the
//! most one word can carry.

/// Width of the type tag in a message word.
pub const MSG_TYPE_BITS: u32 = 4;

/// Mask selecting the type tag.
pub const MSG_TYPE_MASK: u32 = (1 << MSG_TYPE_BITS) - 1;

/// Bytes of string data carried per `Data` reply.
pub const MSG_CHUNK_BYTES: usize = 3;

/// Allocation margin added to the reported rundir length when the daemon
/// manages the directory, so clients can size a buffer for a UID-suffixed
/// subpath without a second round trip.
pub const DIRLEN_MAX: u32 = 32;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    /// Server: service manager is coming up, wait for `OkDone`.
    OkWait = 0x1,
    /// Server: ready; aux carries the DBus-export flag in bit 0.
    OkDone = 0x2,
    /// Client: request the rundir string length.
    ReqRlen = 0x3,
    /// Client: request the next chunk; aux is the remaining length R.
    ReqRdata = 0x4,
    /// Server: length or string chunk payload.
    Data = 0x5,
    /// Client: begin or attach a session; aux is the UID.
    Start = 0x6,
    /// Server: fatal for this connection.
    Err = 0x7,
}

impl MsgType {
    /// Extract the type tag from a message word.
    pub fn from_word(word: u32) -> Option<MsgType> {
        match word & MSG_TYPE_MASK {
            0x1 => Some(MsgType::OkWait),
            0x2 => Some(MsgType::OkDone),
            0x3 => Some(MsgType::ReqRlen),
            0x4 => Some(MsgType::ReqRdata),
            0x5 => Some(MsgType::Data),
            0x6 => Some(MsgType::Start),
            0x7 => Some(MsgType::Err),
            _ => None,
        }
    }
}

/// Pack a type tag and auxiliary payload into a message word.
///
/// Aux values wider than 28 bits do not fit; the caller is responsible for
/// staying within range (UIDs and rundir lengths do in practice).
pub fn encode(ty: MsgType, aux: u32) -> u32 {
    (aux << MSG_TYPE_BITS) | ty as u32
}

/// The auxiliary payload of a message word.
pub fn aux(word: u32) -> u32 {
    word >> MSG_TYPE_BITS
}

/// Reply word for a rundir-length request.
///
/// An empty rundir yields a bare `Data` word (length 0). When the daemon
/// manages the directory the reported length is inflated by [`DIRLEN_MAX`].
pub fn rundir_len_reply(rundir: &str, managed: bool) -> u32 {
    if rundir.is_empty() {
        return encode(MsgType::Data, 0);
    }
    let len = rundir.len() as u32;
    if managed {
        encode(MsgType::Data, len + DIRLEN_MAX)
    } else {
        encode(MsgType::Data, len)
    }
}

/// Reply word for a rundir-data request with `r` bytes remaining.
///
/// Returns `None` when `r` is out of range (zero, or more than the string
/// holds); the caller answers with `Err`. Otherwise packs `min(r, 3)` bytes
/// read from offset `len - r`, little-endian, lowest offset in the lowest
/// bits.
pub fn rundir_chunk_reply(rundir: &str, r: u32) -> Option<u32> {
    let len = rundir.len() as u32;
    if r == 0 || r > len {
        return None;
    }
    let off = (len - r) as usize;
    let take = (r as usize).min(MSG_CHUNK_BYTES);
    let mut data = 0u32;
    for (i, b) in rundir.as_bytes()[off..off + take].iter().enumerate() {
        data |= (*b as u32) << (8 * i);
    }
    Some(encode(MsgType::Data, data))
}

/// Unpack `count` bytes from a `Data` reply, in transfer order.
///
/// This is the client half of the chunk dance; the daemon itself only uses
/// it in tests.
pub fn chunk_bytes(word: u32, count: usize) -> Vec<u8> {
    let data = aux(word);
    (0..count.min(MSG_CHUNK_BYTES))
        .map(|i| (data >> (8 * i)) as u8)
        .collect()
}

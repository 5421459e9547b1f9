use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use super::SLOT_CAPACITY;
use crate::error::{Error, Result};
use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            #[inline(always)]
            fn [< set_ $field >](&mut self, val: $ty) {
                self.bits[$lsb..=$msb].store_le::<$ty>(val);
            }

            #[inline(always)]
            fn $field(&self) -> $ty {
                self.bits[$lsb..=$msb].load_le::<$ty>()
            }
        }
    };
}

/// Kind of a [`ControlMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgKind {
    /// Publishes the receiver's memory region and its first slot set.
    Mr = 0,

    /// Grants more slots.
    Assign = 1,
}

impl TryFrom<u32> for MsgKind {
    type Error = Error;

    fn try_from(val: u32) -> Result<Self> {
        match val {
            0 => Ok(Self::Mr),
            1 => Ok(Self::Assign),
            _ => Err(Error::ControlMsg("unknown message kind")),
        }
    }
}

/// Fixed header of a control message on the wire, 20 bytes.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |  31 | kind         |
/// |  32 |  95 | remote_addr  |
/// |  96 | 127 | remote_key   |
/// | 128 | 159 | slot_count   |
///
/// Followed by `SLOT_CAPACITY` little-endian `u64` slot offsets.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct WireHeader {
    bits: bv::BitArr!(for 160, in u8, bv::Lsb0),
}

impl WireHeader {
    const SIZE: usize = 20;

    impl_accessor!(kind, u32, 0, 31);
    impl_accessor!(remote_addr, u64, 32, 95);
    impl_accessor!(remote_key, u32, 96, 127);
    impl_accessor!(slot_count, u32, 128, 159);

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut this = Self {
            bits: bv::BitArray::ZERO,
        };
        this.bits.as_raw_mut_slice()[..Self::SIZE].copy_from_slice(&bytes[..Self::SIZE]);
        this
    }
}

/// A slot-credit control message, exchanged over the reliable channel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: MsgKind,

    /// Base address of the receiver's registered guest memory. Only
    /// meaningful in `Mr` messages.
    pub remote_addr: u64,

    /// Remote key of that memory. Only meaningful in `Mr` messages.
    pub remote_key: RKey,

    slot_count: u32,
    data_ptr: [u64; SLOT_CAPACITY],
}

impl ControlMessage {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize = WireHeader::SIZE + 8 * SLOT_CAPACITY;

    fn with_slots(kind: MsgKind, remote_addr: u64, remote_key: RKey, slots: &[u64]) -> Self {
        assert!(slots.len() <= SLOT_CAPACITY, "too many slots in one message");
        let mut data_ptr = [0u64; SLOT_CAPACITY];
        data_ptr[..slots.len()].copy_from_slice(slots);
        Self {
            kind,
            remote_addr,
            remote_key,
            slot_count: slots.len() as u32,
            data_ptr,
        }
    }

    /// An `Mr` message publishing `[remote_addr, rkey]` and the first slots.
    pub fn mr(remote_addr: u64, remote_key: RKey, slots: &[u64]) -> Self {
        Self::with_slots(MsgKind::Mr, remote_addr, remote_key, slots)
    }

    /// An `Assign` message granting `slots`.
    pub fn assign(slots: &[u64]) -> Self {
        Self::with_slots(MsgKind::Assign, 0, 0, slots)
    }

    /// Offsets of the granted slots.
    #[inline]
    pub fn slots(&self) -> &[u64] {
        &self.data_ptr[..self.slot_count as usize]
    }

    /// Serialize into the first [`WIRE_SIZE`](Self::WIRE_SIZE) bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panic if `buf` is shorter than `WIRE_SIZE`.
    pub fn encode(&self, buf: &mut [u8]) {
        let mut hdr = WireHeader {
            bits: bv::BitArray::ZERO,
        };
        hdr.set_kind(self.kind as u32);
        hdr.set_remote_addr(self.remote_addr);
        hdr.set_remote_key(self.remote_key);
        hdr.set_slot_count(self.slot_count);

        buf[..WireHeader::SIZE].copy_from_slice(hdr.bits.as_raw_slice());
        for (i, ptr) in self.data_ptr.iter().enumerate() {
            let off = WireHeader::SIZE + i * 8;
            buf[off..off + 8].copy_from_slice(&ptr.to_le_bytes());
        }
    }

    /// Parse a message, rejecting short buffers, unknown kinds and slot
    /// counts beyond capacity.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::ControlMsg("short message"));
        }
        let hdr = WireHeader::from_bytes(buf);
        let kind = MsgKind::try_from(hdr.kind())?;
        let slot_count = hdr.slot_count();
        if slot_count as usize > SLOT_CAPACITY {
            return Err(Error::ControlMsg("slot count exceeds capacity"));
        }

        let mut data_ptr = [0u64; SLOT_CAPACITY];
        for (i, ptr) in data_ptr.iter_mut().enumerate() {
            let off = WireHeader::SIZE + i * 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[off..off + 8]);
            *ptr = u64::from_le_bytes(raw);
        }
        Ok(Self {
            kind,
            remote_addr: hdr.remote_addr(),
            remote_key: hdr.remote_key(),
            slot_count,
            data_ptr,
        })
    }
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlMessage")
            .field("kind", &self.kind)
            .field("remote_addr", &format_args!("{:#x}", self.remote_addr))
            .field("remote_key", &format_args!("{:#x}", self.remote_key))
            .field("slots", &self.slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(mem::size_of::<WireHeader>(), 20);
        assert_eq!(ControlMessage::WIRE_SIZE, 84);
    }

    #[test]
    fn wire_bytes_are_little_endian() {
        let msg = ControlMessage::mr(0x1122_3344_5566_7788, 0xaabb_ccdd, &[0x40, 0x80]);
        let mut buf = [0u8; ControlMessage::WIRE_SIZE];
        msg.encode(&mut buf);

        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[4..12], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[12..16], &0xaabb_ccddu32.to_le_bytes());
        assert_eq!(&buf[16..20], &2u32.to_le_bytes());
        assert_eq!(&buf[20..28], &0x40u64.to_le_bytes());
        assert_eq!(&buf[28..36], &0x80u64.to_le_bytes());

        let back = ControlMessage::decode(&buf).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.slots(), &[0x40, 0x80]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut buf = [0u8; ControlMessage::WIRE_SIZE];
        ControlMessage::assign(&[1]).encode(&mut buf);

        assert!(ControlMessage::decode(&buf[..10]).is_err());

        let mut bad_kind = buf;
        bad_kind[0] = 9;
        assert!(matches!(
            ControlMessage::decode(&bad_kind),
            Err(Error::ControlMsg(_))
        ));

        let mut bad_count = buf;
        bad_count[16] = (SLOT_CAPACITY + 1) as u8;
        assert!(ControlMessage::decode(&bad_count).is_err());
    }
}

//! Type aliases used in this library.

/// [`u16`]: Engine identifier within a host.
/// Connection-manager messages are routed to engines by this ID.
pub type EngineId = u16;

/// [`u32`]: Connection identifier, an index into an engine's session arena.
pub type ConnId = u32;

/// [`u64`]: Work request identifier.
pub type WrId = u64;

/// [`u32`]: Local key of a registered memory region.
pub type LKey = u32;

/// [`u32`]: Remote key of a registered memory region.
pub type RKey = u32;

/// [`u32`] (24 bits valid): Queue pair number.
pub type Qpn = u32;

/// [`u16`]: Forwarding-table key derived from a MAC address.
pub type HashKey = u16;

/// [`[u8; 6]`]: Ethernet MAC address.
pub type MacAddr = [u8; 6];

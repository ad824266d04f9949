/// Capability tier attached to an inbound frame by the transport layer.
///
/// Commands declare the minimum level they accept. The ordering is
/// `None < Device < Network`; a frame authenticated at `Network` level may
/// invoke `Device` commands but not the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    /// The transport could not authenticate the sender.
    None = 0,
    /// Authenticated with the device-local key.
    Device = 1,
    /// Authenticated with the network key.
    Network = 2,
}

impl AuthLevel {
    /// True if this level satisfies the supplied requirement.
    #[inline]
    pub fn satisfies(self, required: AuthLevel) -> bool {
        self >= required
    }
}

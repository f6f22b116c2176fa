/// A channel carrying UCI packets to and from the peer
///
/// The core calls [`Transport::packet_send_ready`] when packets become
/// available after the TX queue was empty. The transport then borrows them
/// one at a time with [`Uci::packet_send_get_ready`] and returns each with
/// [`Uci::packet_send_done`].
///
/// Callbacks run while the core is borrowed. They must only signal (wake a
/// task, raise an interrupt, set a flag) and never call back into the core.
///
/// [`Uci::packet_send_get_ready`]: super::Uci::packet_send_get_ready
/// [`Uci::packet_send_done`]: super::Uci::packet_send_done
pub trait Transport: Send {
    /// Called once when the transport is attached to a context
    fn attach(&mut self) {}

    /// Called once when the transport is detached from a context
    fn detach(&mut self) {}

    /// Packets are waiting to be sent
    fn packet_send_ready(&mut self);
}

/// The states a connection moves through. A connection only exists between
/// an open and its removal from the connection table, so there is no LISTEN
/// state, and the TIME-WAIT and CLOSE-WAIT states of RFC 9293 are not modeled.
///
/// ```text
///   active open, snd SYN           passive open, rcv SYN
///     +-----------+                  +-----------+
///     | SYN-SENT  |                  | SYN-RCVD  |
///     +-----------+                  +-----------+
///           | rcv SYN,ACK                  | snd SYN,ACK
///           | snd ACK                      |
///           V                              V
///     +--------------------------------------------+
///     |                ESTABLISHED                 |
///     +--------------------------------------------+
///           | close                        | rcv FIN
///           | snd FIN                      | snd FIN,ACK
///           V                              V
///     +-----------+  rcv FIN         +-----------+
///     | FIN-WAIT-1|----------+       | LAST-ACK  |
///     +-----------+  snd ACK |       +-----------+
///           | rcv ACK        V             | rcv ACK of FIN
///           V           +---------+        |
///     +-----------+     | CLOSING |        |
///     | FIN-WAIT-2|     +---------+        |
///     +-----------+          |             |
///           | rcv FIN        | rcv ACK     |
///           | snd ACK        |             |
///           V                V             V
///     +--------------------------------------------+
///     |                   CLOSED                   |
///     +--------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Removed, or about to be removed, from the connection table
    Closed,
    /// Waiting for a matching connection request after having sent one
    SynSent,
    /// Received a connection request; a SYN,ACK is about to be or has been
    /// sent
    SynReceived,
    /// The normal state for the data transfer phase of the connection
    Established,
    /// Sent a FIN that has not yet been acknowledged
    FinWait1,
    /// Our FIN was acknowledged; waiting for the remote FIN
    FinWait2,
    /// Both sides sent FINs before either was acknowledged
    Closing,
    /// Answered the remote FIN with our own and waiting for its
    /// acknowledgment
    LastAck,
}

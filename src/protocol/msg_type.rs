use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Message types on the wire. The numeric ranges mirror who originates a message: low values
///  for client-originated messages, values from 50 for server-originated responses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Login = 0,
    KeepAlive = 1,
    CommonData = 2,
    Logout = 3,
    /// explicit application-level ack for a QoS message - the payload carries the acked
    ///  fingerprint
    Received = 4,
    Echo = 5,

    LoginResponse = 50,
    KeepAliveResponse = 51,
    ErrorResponse = 52,
    EchoResponse = 53,
}

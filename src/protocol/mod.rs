// Protocol module - WHAT NODES SAY
// Envelope, reply, and message-hash types shared by every transport

mod envelope;

pub use envelope::{
    Body, Envelope, MessageHash, MessageKind, ProtocolError, Rejection, Reply, MAX_FRAME_SIZE,
};

// Transport module - THE WIRE (abstract)
// Provides the dial/send/listen contract plus TCP and in-process implementations

mod traits;
mod tcp;
mod memory;

pub use traits::{
    // Core traits
    Connection, InboundHandler, Transport,
    // Configuration
    TransportConfig,
    // Accept loop handle
    Listener,
    // Errors
    TransportError,
};

pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};

//! Remote sessions over SSH.

pub mod session;
pub mod transport;

pub use session::{
    CommandOutput, ConnectionSession, Connector, SessionParams, SessionTransport, TransportError,
};
pub use transport::Ssh2Connector;

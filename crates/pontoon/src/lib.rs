//! Pontoon: a peer-to-peer data channel between a desktop client and a mobile
//! prover. The desktop side publishes an offer through a signal store, shows
//! the session to the phone as a QR payload, and once the direct channel is
//! up the two sides exchange identity-proof messages until an unsigned
//! on-chain transaction is ready for the caller to sign.

pub mod contract;
pub mod link;
pub mod protocol;
pub mod session;
pub mod transport;

pub use contract::{ContractBridge, ProofParameters, TransactionBuildError, UnsignedTx};
pub use link::{
    ConnectionState, LinkConfig, LinkCoordinator, LinkRole, NegotiationError, NegotiationPhase,
};
pub use protocol::{Envelope, HandshakePayload, ValidationError};
pub use session::{PontoonClient, ProofSession, SessionError, SessionOptions, SessionState};
pub use transport::{IceConfig, IceServer, PeerTransport, PeerTransportFactory, TransportError};

pub mod crypto;
pub mod facts;
pub mod frame;
pub mod hub;
pub mod message;
pub mod session;
pub mod time;
pub mod transport;
pub mod varint;
pub mod vm;

pub use crypto::{CryptoError, Keypair, SigAlg, TrustRoot};
pub use facts::SystemFacts;
pub use frame::{FrameError, Packet};
pub use message::{Message, MessageError};
pub use session::{Session, SessionError};

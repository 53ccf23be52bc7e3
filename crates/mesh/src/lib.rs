pub mod cipher;
pub mod config;
pub mod discovery;
pub mod election;
pub mod error;
pub mod node;
pub mod roster;
pub mod telemetry;
pub mod transport;

pub use cipher::XorCipher;
pub use config::MeshConfig;
pub use discovery::Discovery;
pub use election::LeaderElection;
pub use error::{MeshError, Result};
pub use node::MeshNode;
pub use roster::{PeerEntry, Roster};
pub use telemetry::{
    DeadlineMonitor, DeliveryLedger, NetEvent, Recorder, Telemetry, TransmissionTimes,
};
pub use transport::{private_topic, ControlReceiver, MessageHandler, Transport, PUBLIC_TOPIC};

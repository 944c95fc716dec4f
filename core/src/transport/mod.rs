// Transport module: libp2p swarm and networking

pub mod admission;
pub mod behaviour;
pub mod dial;
pub mod swarm;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionError};
pub use behaviour::{BehaviourOptions, WhooshBehaviour};
pub use dial::{DialPlan, DialTracker};
pub use swarm::{start_swarm, SwarmCommand, SwarmFeeds, SwarmHandle, SwarmOptions};

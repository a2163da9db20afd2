#![allow(unused_imports)]
pub use std::{net, thread};
pub use std::io::{Read, Write};
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use chain_p2p::{Clock, Config, DisconnectReason, ManualClock, Network, SystemClock};
pub use chain_p2p::addrmgr::{MemoryStore, PeerAddress, PeerRecord, Store};
pub use chain_p2p::identity::Identity;
pub use chain_p2p::wire::{Codec, Hello, Message};

pub use super::TestController;

//! Protocol constants.

/// Message magic of the main network ("QORT").
pub const MAINNET_MAGIC: [u8; 4] = [0x51, 0x4f, 0x52, 0x54];

/// Message magic of the test network ("qorT").
pub const TESTNET_MAGIC: [u8; 4] = [0x71, 0x6f, 0x72, 0x54];

/// Default port peers listen on.
pub const DEFAULT_PORT: u16 = 12392;

/// The protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 3;

/// The oldest protocol version we accept from peers.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Size of the frame header: magic, type and payload length.
pub const HEADER_SIZE: usize = 4 + 1 + 4;

/// Maximum length of a textual peer address in peer-exchange messages.
pub const MAX_ADDRESS_LEN: usize = 255;

/// Maximum length of the version string in a HELLO message.
pub const MAX_VERSION_LEN: usize = 255;

/// Size of the random handshake challenge.
pub const CHALLENGE_SIZE: usize = 32;

// Message type codes //////////////////////////////////////////////////////////

pub const MSG_HELLO: u8 = 0;
pub const MSG_CHALLENGE: u8 = 2;
pub const MSG_RESPONSE: u8 = 3;
pub const MSG_HEIGHT_V2: u8 = 10;
pub const MSG_PING: u8 = 11;
pub const MSG_PEERS_V2: u8 = 20;
pub const MSG_GET_PEERS: u8 = 21;

/// Application message types with this bit set start their payload with a
/// 4-byte correlation id.
pub const MSG_ID_FLAG: u8 = 0x80;

/// Tag for peers added from the fixed network list.
pub const ADDED_BY_FIXED_NETWORK: &str = "fixed-network";

/// Tag for peers added from the configured initial peers.
pub const ADDED_BY_INITIAL: &str = "initial";

/// Tag for peers learned through peer-exchange.
pub const ADDED_BY_PEER_EXCHANGE: &str = "peer-exchange";

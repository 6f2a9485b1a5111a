//! Wire protocol: frame codec and login payloads

pub mod credentials;
pub mod frame;

pub use credentials::{password_digest, Credentials, LoginResult};
pub use frame::{
    decode, encode_handshake, encode_method_call, encode_ping, encode_pong, encode_subscribe,
    encode_unsubscribe, DataFrame, DataKind, Envelope, ErrorBody, PushEvent, DDP_VERSIONS,
};

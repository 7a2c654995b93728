use thiserror::Error;

use crate::call::CallState;
use crate::identity::IdentityError;
use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call with {0} is already in progress")]
    AlreadyActive(String),

    #[error("no call with {0}")]
    NoCall(String),

    #[error("cannot call our own identity")]
    SelfCall,

    #[error("unexpected {signal} from {peer} while call is {state:?}")]
    UnexpectedSignal {
        peer: String,
        signal: &'static str,
        state: CallState,
    },

    #[error("call with {0} was closed before negotiation finished")]
    Cancelled(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

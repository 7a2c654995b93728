//! Client side of ProxCity calls.
//!
//! A [`CallController`] owns every call this device takes part in. Signaling
//! frames from the server and events from the media engine are fed into it,
//! and it answers with frames on an outbound channel plus [`CallEvent`]s for
//! the UI. [`SignalingConnection`] wires a controller to a live websocket.

pub mod call;
pub mod candidates;
pub mod connection;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod identity;
pub mod media;

pub use call::{CallRole, CallState};
pub use connection::{ClientConfig, SignalingConnection};
pub use connectivity::ConnectivityState;
pub use controller::{CallController, CallEvent};
pub use error::CallError;
pub use identity::{IdentityError, IdentityProvider, StaticIdentity};
pub use media::{MediaEngine, MediaEngineFactory, MediaError, MediaEvent, MediaEventSink, SdpKind};

//! # pt-remote
//!
//! Best-effort mirroring of optimization sessions to a remote coordination
//! service. The local session is always authoritative: every failure here is
//! absorbed by [`RemoteMirror`], which degrades to local-only operation.

mod backend;
mod http;
mod memory;
mod mirror;

pub use backend::{
    CreateSessionRequest, FinalizeRequest, RemoteBackend, RemoteSessionId, TrialSubmission,
};
pub use http::{HttpRemoteBackend, RemoteConfig, RemoteCredentials};
pub use memory::{InMemoryBackend, RecordedSession, RemoteOperation};
pub use mirror::{MirrorOutcome, Reachability, RemoteMirror, RemoteMirrorState};

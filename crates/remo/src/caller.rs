use std::net::SocketAddr;

/// Strong type for server-side session identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// The peer on whose behalf an object operation runs.
///
/// Passed to every object-model and access-control call made while serving a
/// remote request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCaller {
    pub session: SessionId,
    pub peer: SocketAddr,
}

impl RemoteCaller {
    pub fn new(session: SessionId, peer: SocketAddr) -> Self {
        Self { session, peer }
    }
}

impl std::fmt::Display for RemoteCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.session, self.peer)
    }
}

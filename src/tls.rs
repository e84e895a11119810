//! Pluggable TLS boundary.
//!
//! The reactor drives TLS through two small traits instead of binding
//! to a specific implementation. A [`TlsFactory`] mints one
//! [`TlsSession`] per connection; the reactor then interleaves
//! handshake steps with its readiness loop, translating
//! [`TlsStatus::WantRead`] / [`TlsStatus::WantWrite`] into poll
//! interests until the handshake completes.
//!
//! Tests install an in-memory factory; production embeddings wrap a
//! real TLS stack behind the same traits.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// Why a TLS operation could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// The session needs more bytes from the peer.
    WantRead,

    /// The session has bytes to flush to the peer.
    WantWrite,

    /// The session failed and the connection must close.
    Failed,
}

/// One TLS session bound to a socket.
///
/// All methods are non-blocking: instead of waiting, they report the
/// readiness they need through [`TlsStatus`].
pub trait TlsSession {
    /// Advances the server-side handshake.
    fn accept(&mut self) -> Result<(), TlsStatus>;

    /// Advances the client-side handshake.
    fn connect(&mut self) -> Result<(), TlsStatus>;

    /// Reads decrypted bytes into `buf`. `Ok(0)` means the peer
    /// closed the session.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsStatus>;

    /// Writes plaintext bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TlsStatus>;
}

/// Creates TLS sessions for accepted and outbound connections.
///
/// `config` is the certificate material installed on the connection
/// (for accepted connections, on its listener) through
/// [`Conn::set_tls`](crate::conn::Conn::set_tls).
pub trait TlsFactory {
    /// Creates a server-side session over an accepted socket.
    fn server_session(&self, fd: RawFd, config: &TlsConfig) -> io::Result<Box<dyn TlsSession>>;

    /// Creates a client-side session over a connected socket.
    fn client_session(&self, fd: RawFd, config: &TlsConfig) -> io::Result<Box<dyn TlsSession>>;
}

/// Certificate material a factory implementation loads from.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Path to the certificate (and key) in PEM form.
    pub cert: Option<PathBuf>,

    /// Path to the CA bundle used to verify the peer.
    pub ca_cert: Option<PathBuf>,
}

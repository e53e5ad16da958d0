//! C5 — the target (origin) connection state machine.
//!
//! Grounded in `original_source/proxy-target-handler.c`: drain the staged
//! request, parse the response purely to know when one HTTP message ends,
//! append every raw byte to the cache entry regardless of what the parser
//! makes of them, and finalize the entry by status-code policy the moment
//! the message boundary is reached by any of the three routes spec.md §4.5
//! names — `message_complete`, EOF, or hangup.

use std::net::ToSocketAddrs;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::ByteBuffer;
use crate::cache::{Cache, CacheEntry};
use crate::error::TargetError;
use crate::mux::{EventHandler, MuxHandle, Readiness};
use crate::parser::{HttpParser, Mode, ParserSink};

struct NullSink;
impl ParserSink for NullSink {}

struct TargetInner {
    stream: TcpStream,
    parser: HttpParser,
    outbound: ByteBuffer,
    connected: bool,
    finalized: bool,
}

pub struct TargetConn {
    token: Token,
    /// The client's own token, so a fully-drained outbound buffer can
    /// re-enable the client's readable interest (spec.md §4.4's
    /// "Send-to-target" backpressure contract, symmetric with
    /// `client_output_handler` in `proxy-target-handler.c`).
    client_token: Token,
    mux: MuxHandle,
    cache: Arc<Cache>,
    entry: Arc<CacheEntry>,
    inner: Mutex<TargetInner>,
}

/// Split `host[:port]` on the last colon, defaulting to port 80 when no
/// colon is present or the suffix after it doesn't parse as a port.
fn parse_host_port(raw: &str) -> (String, u16) {
    let raw = raw.trim();
    match raw.rfind(':') {
        Some(idx) => {
            let host = &raw[..idx];
            match raw[idx + 1..].parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (raw.to_string(), 80),
            }
        }
        None => (raw.to_string(), 80),
    }
}

impl TargetConn {
    /// Resolve `host_port`, refuse TLS, open a non-blocking connection and
    /// register it with the multiplexer, handing off `staged` (the
    /// client's pre-connection outbound buffer) as the first bytes to
    /// send once the connect completes.
    pub fn spawn(
        mux: &MuxHandle,
        cache: Arc<Cache>,
        entry: Arc<CacheEntry>,
        host_port: &str,
        staged: Vec<u8>,
        client_token: Token,
    ) -> Result<Arc<TargetConn>, TargetError> {
        let (host, port) = parse_host_port(host_port);
        if port == 443 {
            return Err(TargetError::TlsRefused(443));
        }

        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| TargetError::Resolve(host.clone()))?
            .next()
            .ok_or_else(|| TargetError::Resolve(host.clone()))?;

        let stream = TcpStream::connect(addr)?;

        let target = Arc::new(TargetConn {
            token: mux.next_token(),
            client_token,
            mux: mux.clone(),
            cache,
            entry,
            inner: Mutex::new(TargetInner {
                stream,
                parser: HttpParser::new(Mode::Response),
                outbound: ByteBuffer::from(staged),
                connected: false,
                finalized: false,
            }),
        });

        let fd = target.inner.lock().stream.as_raw_fd();
        let handler: Arc<dyn EventHandler> = Arc::clone(&target) as Arc<dyn EventHandler>;
        mux.add(fd, target.token, handler)?;
        mux.enable_out(target.token);
        Ok(target)
    }

    /// Append more request bytes once the target already exists (used by
    /// the client for headers/body emitted after `Host`).
    pub fn append_outbound(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }
        inner.outbound.append(bytes);
        drop(inner);
        self.mux.enable_out(self.token);
    }

    fn finalize(&self, inner: &mut TargetInner) {
        if inner.finalized {
            return;
        }
        inner.finalized = true;
        let url = self.entry.url();
        let bytes = self.entry.body_len();
        match inner.parser.status_code {
            Some(200) => {
                debug!(url, bytes, "response finalized, cache entry usable");
                self.cache.mark_finished(&self.entry);
            }
            status => {
                debug!(url, bytes, ?status, "response finalized, cache entry invalidated");
                self.cache.mark_invalid_and_finished(&self.entry);
            }
        }
    }

    fn teardown(&self, inner: &mut TargetInner) {
        self.finalize(inner);
        inner.outbound.free();
        self.mux.remove(self.token);
    }
}

impl EventHandler for TargetConn {
    fn on_ready(&self, _mux: &MuxHandle, readiness: Readiness) {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return;
        }

        if readiness.writable {
            if !inner.connected {
                match inner.stream.take_error() {
                    Ok(None) => inner.connected = true,
                    _ => {
                        self.teardown(&mut inner);
                        return;
                    }
                }
                self.mux.enable_in(self.token);
            }

            loop {
                if inner.outbound.is_empty() {
                    self.mux.cancel_out(self.token);
                    // The client may have had its readable interest
                    // cancelled (backpressure) while this buffer was
                    // non-empty; now that it has drained, let it resume.
                    self.mux.enable_in(self.client_token);
                    break;
                }
                match std::io::Write::write(&mut inner.stream, inner.outbound.as_slice()) {
                    Ok(0) => {
                        self.teardown(&mut inner);
                        return;
                    }
                    Ok(n) => inner.outbound.substring_from(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.teardown(&mut inner);
                        return;
                    }
                }
            }
        }

        if readiness.readable {
            let mut buf = [0u8; 8192];
            loop {
                match std::io::Read::read(&mut inner.stream, &mut buf) {
                    Ok(0) => {
                        self.teardown(&mut inner);
                        return;
                    }
                    Ok(n) => {
                        if self.cache.append(&self.entry, &buf[..n]).is_err() {
                            self.teardown(&mut inner);
                            return;
                        }
                        let mut sink = NullSink;
                        if inner.parser.execute(&mut sink, &buf[..n]).is_err() {
                            self.teardown(&mut inner);
                            return;
                        }
                        if inner.parser.is_message_complete() {
                            self.teardown(&mut inner);
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        self.teardown(&mut inner);
                        return;
                    }
                }
            }
        }

        if readiness.hangup {
            self.teardown(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_defaults_to_80() {
        assert_eq!(parse_host_port("example.test"), ("example.test".to_string(), 80));
    }

    #[test]
    fn parse_host_port_reads_explicit_port() {
        assert_eq!(parse_host_port("example.test:8080"), ("example.test".to_string(), 8080));
    }

    #[test]
    fn parse_host_port_falls_back_on_garbage_suffix() {
        assert_eq!(
            parse_host_port("example.test:notaport"),
            ("example.test:notaport".to_string(), 80)
        );
    }
}

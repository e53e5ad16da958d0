//! C4 — the client connection state machine.
//!
//! Grounded in `original_source/proxy-client-handler.c`. Parser callbacks
//! drive header rewriting and the cache-vs-origin decision inline, in the
//! same "dispatch-from-callback" shape the teacher (`epheo-kiss`) uses for
//! its own request handling, generalized from "read a full request, then
//! act" to "act incrementally as the parser resolves each token", since
//! `recv` never promises a full request in one call.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::cache::{Cache, CacheEntry, CacheLookup, CacheReader};
use crate::mux::{EventHandler, MuxHandle, Readiness};
use crate::parser::{HttpParser, Method, Mode, ParserSink};
use crate::target::TargetConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Parsing,
    TargetPending,
    Streaming,
    Closing,
}

struct ClientInner {
    stream: TcpStream,
    parser: HttpParser,
    state: ClientState,
    method: Option<Method>,
    url_buf: ByteBuffer,
    url_dumped: bool,
    cur_field: ByteBuffer,
    cur_value: ByteBuffer,
    in_value: bool,
    /// Pre-connection staging buffer: the rewritten initial line and any
    /// headers emitted before `Host` arrives. Moved wholesale into the
    /// target's own outbound buffer the instant a target is constructed.
    to_target: ByteBuffer,
    target: Option<Arc<TargetConn>>,
    use_cache: bool,
    entry: Option<Arc<CacheEntry>>,
    reader: Option<CacheReader>,
    cache_offset: usize,
    out_buf: ByteBuffer,
}

pub struct ClientConn {
    token: Token,
    mux: MuxHandle,
    cache: Arc<Cache>,
    inner: Mutex<ClientInner>,
}

impl ClientConn {
    pub fn accept(
        mux: &MuxHandle,
        cache: Arc<Cache>,
        stream: TcpStream,
    ) -> std::io::Result<Arc<ClientConn>> {
        let token = mux.next_token();
        let conn = Arc::new(ClientConn {
            token,
            mux: mux.clone(),
            cache,
            inner: Mutex::new(ClientInner {
                stream,
                parser: HttpParser::new(Mode::Request),
                state: ClientState::Parsing,
                method: None,
                url_buf: ByteBuffer::new(),
                url_dumped: false,
                cur_field: ByteBuffer::new(),
                cur_value: ByteBuffer::new(),
                in_value: false,
                to_target: ByteBuffer::new(),
                target: None,
                use_cache: false,
                entry: None,
                reader: None,
                cache_offset: 0,
                out_buf: ByteBuffer::new(),
            }),
        });
        let fd = conn.inner.lock().stream.as_raw_fd();
        let handler: Arc<dyn EventHandler> = Arc::clone(&conn) as Arc<dyn EventHandler>;
        mux.add(fd, token, handler)?;
        mux.enable_in(token);
        Ok(conn)
    }

    /// Feed one `recv`'d chunk to the parser. The parser itself is swapped
    /// out for the duration of the call so callbacks can freely mutate the
    /// rest of `inner` (including via `self`) without an overlapping
    /// mutable borrow of `inner.parser`.
    fn feed_parser(&self, inner: &mut ClientInner, data: &[u8]) -> bool {
        let mut parser = std::mem::replace(&mut inner.parser, HttpParser::new(Mode::Request));
        let mut sink = ClientSink { conn: self, inner };
        let ok = parser.execute(&mut sink, data).is_ok();
        inner.parser = parser;
        ok
    }

    fn dump_initial_line(&self, inner: &mut ClientInner) {
        let method = inner.method.unwrap_or(Method::Get);
        let path = rewrite_path(&inner.url_buf.as_str_lossy());
        let line = format!("{} {} HTTP/1.0\r\n", method.as_str(), path);
        self.send_to_target(inner, line.as_bytes());
    }

    fn complete_header(&self, inner: &mut ClientInner) {
        let key = inner.cur_field.as_slice().to_vec();
        let value = inner.cur_value.as_slice().to_vec();
        if key == b"Connection" {
            self.send_to_target(inner, b"Connection: close\r\n");
        } else if key == b"Host" {
            let host_value = String::from_utf8_lossy(&value).into_owned();
            self.connect_with_cache(inner, &host_value);
            self.send_to_target(inner, b"Host: ");
            self.send_to_target(inner, &value);
            self.send_to_target(inner, b"\r\n");
        } else {
            self.send_to_target(inner, &key);
            self.send_to_target(inner, b": ");
            self.send_to_target(inner, &value);
            self.send_to_target(inner, b"\r\n");
        }
    }

    /// `find_or_create(url)` keyed by the accumulated request URL; `host`
    /// (from the `Host` header) is used only to resolve where to connect.
    fn connect_with_cache(&self, inner: &mut ClientInner, host: &str) {
        inner.state = ClientState::TargetPending;
        let url = inner.url_buf.as_str_lossy().into_owned();
        match self.cache.find_or_create(&url) {
            CacheLookup::Found(entry) => {
                debug!(%url, "cache hit");
                inner.use_cache = true;
                let mux = self.mux.clone();
                let token = self.token;
                let reader = self.cache.subscribe(&entry, move || {
                    mux.enable_out(token);
                });
                inner.reader = Some(reader);
                inner.entry = Some(entry);
                inner.state = ClientState::Streaming;
            }
            CacheLookup::Created(entry) => {
                debug!(%url, "cache miss, connecting to origin");
                inner.use_cache = false;
                let mux = self.mux.clone();
                let token = self.token;
                let reader = self.cache.subscribe(&entry, move || {
                    mux.enable_out(token);
                });
                inner.reader = Some(reader);
                let staged = inner.to_target.take();
                match TargetConn::spawn(
                    &self.mux,
                    Arc::clone(&self.cache),
                    Arc::clone(&entry),
                    host,
                    staged,
                    self.token,
                ) {
                    Ok(target) => {
                        inner.target = Some(target);
                        inner.entry = Some(entry);
                        inner.state = ClientState::Streaming;
                    }
                    Err(e) => {
                        warn!(%url, %host, error = %e, "target connect failed");
                        // The entry was just created and has no content;
                        // per spec.md §7 ("Lookup failure") it must be
                        // invalidated here rather than left as a zombie
                        // only `find_or_create` will ever garbage-collect.
                        self.cache.mark_invalid_and_finished(&entry);
                        self.teardown(inner);
                    }
                }
            }
        }
    }

    /// Stage or forward request bytes toward the target, per spec.md
    /// §4.4's "Send-to-target" contract: append, enable target-writable
    /// (inside `append_outbound`), and cancel the client's own readable
    /// interest so a slow origin applies backpressure rather than letting
    /// `to_target`/`target.outbound` grow unboundedly (spec.md §7). Mirrors
    /// `original_source/proxy-client-handler.c`'s `send_to_target`, which
    /// calls `sockets_cancel_in_handle(state->client_socket)` on every
    /// call unconditionally; re-enabled from the target side once its
    /// outbound buffer drains (`target::TargetConn::on_ready`).
    fn send_to_target(&self, inner: &mut ClientInner, bytes: &[u8]) {
        if inner.use_cache {
            return;
        }
        if let Some(target) = inner.target.clone() {
            target.append_outbound(bytes);
        } else {
            inner.to_target.append(bytes);
        }
        self.mux.cancel_in(self.token);
    }

    fn teardown(&self, inner: &mut ClientInner) {
        inner.state = ClientState::Closing;
        if let Some(reader) = inner.reader.take() {
            self.cache.unsubscribe(reader);
        }
        inner.entry = None;
        inner.out_buf.free();
        inner.to_target.free();
        self.mux.remove(self.token);
    }

    fn do_readable(&self, inner: &mut ClientInner) {
        let mut buf = [0u8; 8192];
        loop {
            match inner.stream.read(&mut buf) {
                Ok(0) => {
                    self.teardown(inner);
                    return;
                }
                Ok(n) => {
                    if !self.feed_parser(inner, &buf[..n]) {
                        warn!("malformed request, closing client");
                        self.teardown(inner);
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.teardown(inner);
                    return;
                }
            }
        }
    }

    fn do_writable(&self, inner: &mut ClientInner) {
        let Some(entry) = inner.entry.clone() else {
            return;
        };
        loop {
            if inner.out_buf.is_empty() {
                let mut scratch = [0u8; 8192];
                match self.cache.extract(&entry, inner.cache_offset, &mut scratch) {
                    Ok(0) => {
                        if entry.is_finished() {
                            self.teardown(inner);
                        } else {
                            self.mux.cancel_out(self.token);
                        }
                        return;
                    }
                    Ok(n) => {
                        inner.cache_offset += n;
                        inner.out_buf.append(&scratch[..n]);
                    }
                    Err(_) => {
                        self.teardown(inner);
                        return;
                    }
                }
            }
            match inner.stream.write(inner.out_buf.as_slice()) {
                Ok(0) => {
                    self.teardown(inner);
                    return;
                }
                Ok(n) => inner.out_buf.substring_from(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.teardown(inner);
                    return;
                }
            }
        }
    }
}

impl EventHandler for ClientConn {
    fn on_ready(&self, _mux: &MuxHandle, readiness: Readiness) {
        let mut inner = self.inner.lock();
        if inner.state == ClientState::Closing {
            return;
        }
        if readiness.readable {
            self.do_readable(&mut inner);
        }
        if inner.state == ClientState::Closing {
            return;
        }
        if readiness.writable {
            self.do_writable(&mut inner);
        }
        if readiness.hangup && inner.state != ClientState::Closing {
            self.teardown(&mut inner);
        }
    }
}

struct ClientSink<'a> {
    conn: &'a ClientConn,
    inner: &'a mut ClientInner,
}

impl<'a> ParserSink for ClientSink<'a> {
    fn on_method(&mut self, method: Method) {
        self.inner.method = Some(method);
    }

    fn on_url(&mut self, bytes: &[u8]) {
        self.inner.url_buf.append(bytes);
    }

    fn on_header_field(&mut self, bytes: &[u8]) {
        if !self.inner.url_dumped {
            self.inner.url_buf.finalize();
            self.conn.dump_initial_line(self.inner);
            self.inner.url_dumped = true;
            self.inner.state = ClientState::TargetPending;
        }
        if self.inner.in_value && !self.inner.cur_value.is_empty() {
            self.conn.complete_header(self.inner);
            self.inner.cur_field.clear();
            self.inner.cur_value.clear();
            self.inner.in_value = false;
        }
        self.inner.cur_field.append(bytes);
    }

    fn on_header_value(&mut self, bytes: &[u8]) {
        self.inner.cur_field.finalize();
        self.inner.in_value = true;
        self.inner.cur_value.append(bytes);
    }

    fn on_headers_complete(&mut self) {
        if !self.inner.url_dumped {
            self.inner.url_buf.finalize();
            self.conn.dump_initial_line(self.inner);
            self.inner.url_dumped = true;
        }
        if !self.inner.cur_field.is_empty() && !self.inner.cur_value.is_empty() {
            self.conn.complete_header(self.inner);
            self.inner.cur_field.clear();
            self.inner.cur_value.clear();
            self.inner.in_value = false;
        }
        self.conn.send_to_target(self.inner, b"\r\n");
    }

    fn on_body(&mut self, bytes: &[u8]) {
        self.conn.send_to_target(self.inner, bytes);
    }
}

/// The URL suffix starting at the third `/` (stripping `scheme://host`).
/// Falls back to the whole URL, logged, when there are fewer than three
/// slashes — an inherited behavior, not silently patched over.
fn rewrite_path(url: &str) -> String {
    let mut seen = 0;
    for (i, b) in url.bytes().enumerate() {
        if b == b'/' {
            seen += 1;
            if seen == 3 {
                return url[i..].to_string();
            }
        }
    }
    warn!(%url, "fewer than three slashes in request URL, forwarding verbatim");
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_path_strips_scheme_and_host() {
        assert_eq!(rewrite_path("http://example.test/foo/bar"), "/foo/bar");
    }

    #[test]
    fn rewrite_path_keeps_root() {
        assert_eq!(rewrite_path("http://example.test/"), "/");
    }

    #[test]
    fn rewrite_path_falls_back_without_three_slashes() {
        assert_eq!(rewrite_path("http://example.test"), "http://example.test");
    }
}

//! One task per client connection.
//!
//! A session walks through classification, the blocklist check, an optional
//! cache lookup and then either splices a tunnel or streams the origin
//! response back while teeing cacheable bytes into the cache.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::cache::CachedResponse;
use crate::chunked::ChunkAssembler;
use crate::classify::{
    classify, is_websocket_upgrade, read_request_head, ClassifiedRequest, MAX_REQUEST_HEAD,
};
use crate::error::{is_expected_error, ProxyError};
use crate::response::{head_end, ResponseHead};
use crate::state::{unix_now, ProxyState};
use crate::tunnel::splice;

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 FORBIDDEN\r\n\n";
pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 OK\r\n\n";
pub const RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const SEGMENT_SIZE: usize = 64 * 1024;
/// Responses growing past this are relayed without being cached.
const MAX_CACHEABLE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AwaitingClassification,
    Connecting,
    CacheLookup,
    TunnelEstablished,
    StreamingUpstream,
    Splicing,
    Closed,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

pub struct Session {
    state: Arc<ProxyState>,
    config: SessionConfig,
    peer: SocketAddr,
    phase: Phase,
    started: Instant,
}

impl Session {
    pub fn new(state: Arc<ProxyState>, config: SessionConfig, peer: SocketAddr) -> Self {
        Self {
            state,
            config,
            peer,
            phase: Phase::AwaitingClassification,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{} {:?} -> {:?}", self.peer, self.phase, phase);
        self.phase = phase;
    }

    pub async fn run(mut self, mut client: TcpStream) -> Result<(), ProxyError> {
        let _ = client.set_nodelay(true);
        let result = self.serve(&mut client).await;
        self.enter(Phase::Closed);
        result
    }

    async fn serve(&mut self, client: &mut TcpStream) -> Result<(), ProxyError> {
        let head = read_request_head(client, MAX_REQUEST_HEAD).await?;
        if head.is_empty() {
            return Ok(());
        }

        let request = match classify(&head) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request from {}: {}", self.peer, e);
                let _ = client.write_all(RESPONSE_400).await;
                return Err(e);
            }
        };

        if self.state.blocklist.is_blocked(&request.host) {
            self.state.stats.blocked.fetch_add(1, Ordering::Relaxed);
            if self.state.flags.verbose() {
                info!("Blocked {} for {}", request.authority(), self.peer);
            }
            client.write_all(RESPONSE_403).await?;
            let _ = client.shutdown().await;
            return Err(ProxyError::Blocked(request.host));
        }

        if self.state.flags.verbose() {
            info!(
                "{} -> {} https={}",
                self.peer,
                request.authority(),
                request.is_https
            );
        }

        let websocket = !request.is_https && is_websocket_upgrade(&head);
        let caching =
            !request.is_https && !websocket && request.is_get() && self.state.flags.caching();

        if caching {
            self.enter(Phase::CacheLookup);
            if let Some(hit) = self.state.cache.lookup(&request.raw_url, unix_now()) {
                self.state.stats.hits.fetch_add(1, Ordering::Relaxed);
                write_cached(client, &hit).await?;
                if self.state.flags.timing() {
                    info!(
                        "HIT {} served in {:?} ({} bytes)",
                        request.raw_url,
                        self.started.elapsed(),
                        hit.len()
                    );
                }
                return Ok(());
            }
            self.state.stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        self.enter(Phase::Connecting);
        let mut origin = match self.connect(&request).await {
            Ok(origin) => origin,
            Err(e) => {
                if !request.is_https {
                    let _ = client.write_all(RESPONSE_502).await;
                }
                return Err(e);
            }
        };

        if request.is_https {
            self.enter(Phase::TunnelEstablished);
            self.state.stats.tunnels.fetch_add(1, Ordering::Relaxed);
            client.write_all(RESPONSE_200_CONNECT).await?;
            client.flush().await?;
            return self.relay_tunnel(client, &mut origin).await;
        }

        origin.write_all(&head).await?;
        origin.flush().await?;

        if !caching {
            return self.relay_tunnel(client, &mut origin).await;
        }

        self.enter(Phase::StreamingUpstream);
        let (mut client_rd, mut client_wr) = client.split();
        let (mut origin_rd, mut origin_wr) = origin.split();

        // Later client bytes (request bodies, pipelined requests) flow on untouched.
        let upstream = async {
            let sent = tokio::io::copy(&mut client_rd, &mut origin_wr).await;
            let _ = origin_wr.shutdown().await;
            sent
        };
        let downstream = relay_response(
            &mut origin_rd,
            &mut client_wr,
            &self.state,
            &request.raw_url,
        );
        tokio::pin!(upstream, downstream);

        let (sent, received) = tokio::select! {
            received = &mut downstream => (0, received?),
            sent = &mut upstream => {
                let received = downstream.await?;
                (sent.unwrap_or(0), received)
            }
        };

        self.state.stats.bytes_out.fetch_add(sent, Ordering::Relaxed);
        self.state.stats.bytes_in.fetch_add(received, Ordering::Relaxed);

        if self.state.flags.timing() {
            info!(
                "MISS {} fetched in {:?} ({} bytes)",
                request.raw_url,
                self.started.elapsed(),
                received
            );
        }
        Ok(())
    }

    async fn connect(&self, request: &ClassifiedRequest) -> Result<TcpStream, ProxyError> {
        let connect_future = TcpStream::connect((request.host.as_str(), request.port));

        let origin = match self.config.connect_timeout {
            Some(timeout_duration) => match timeout(timeout_duration, connect_future).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Upstream timeout {}", request.authority());
                    return Err(ProxyError::Timeout);
                }
            },
            None => connect_future.await,
        };

        let origin = origin.map_err(|source| ProxyError::Upstream {
            host: request.host.clone(),
            port: request.port,
            source,
        })?;
        let _ = origin.set_nodelay(true);
        Ok(origin)
    }

    async fn relay_tunnel(
        &mut self,
        client: &mut TcpStream,
        origin: &mut TcpStream,
    ) -> Result<(), ProxyError> {
        self.enter(Phase::Splicing);
        let (sent, received) = splice(client, origin, self.config.idle_timeout).await?;
        self.state.stats.bytes_out.fetch_add(sent, Ordering::Relaxed);
        self.state.stats.bytes_in.fetch_add(received, Ordering::Relaxed);
        Ok(())
    }
}

/// Replays a cache hit: the rebuilt head, then every stored chunk in order.
pub async fn write_cached<W>(client: &mut W, hit: &CachedResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match hit {
        CachedResponse::Whole(buf) => client.write_all(buf).await?,
        CachedResponse::Chunked { header, chunks } => {
            client.write_all(header).await?;
            for chunk in chunks.iter() {
                client.write_all(chunk).await?;
            }
        }
    }
    client.flush().await
}

/// Streams one origin response to the client, caching it on the way when
/// the origin allows. Every segment is forwarded as soon as it arrives.
///
/// Once the response is stored, or turns out not to be cacheable, the rest
/// of the connection is copied through without inspection. Returns the
/// number of bytes relayed to the client.
pub async fn relay_response<R, W>(
    origin: &mut R,
    client: &mut W,
    state: &ProxyState,
    url: &str,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut segment = vec![0u8; SEGMENT_SIZE];

    let n = match origin.read(&mut segment).await {
        Ok(n) => n,
        Err(e) if is_expected_error(&e) => 0,
        Err(e) => return Err(e),
    };
    if n == 0 {
        return Ok(0);
    }
    let mut first = segment[..n].to_vec();
    client.write_all(&first).await?;
    let mut relayed = n as u64;

    // The head may straddle reads; keep forwarding until it is whole.
    while head_end(&first).is_none() && first.len() < MAX_REQUEST_HEAD {
        let n = origin.read(&mut segment).await?;
        if n == 0 {
            return Ok(relayed);
        }
        client.write_all(&segment[..n]).await?;
        relayed += n as u64;
        first.extend_from_slice(&segment[..n]);
    }

    let head = ResponseHead::inspect(&first);
    if head.head_len.is_none() || !head.is_cacheable() {
        debug!("Not caching {}: response not cacheable", url);
        return Ok(relayed + passthrough(origin, client).await?);
    }

    if head.chunked {
        let mut asm = ChunkAssembler::new(first);
        while !asm.is_complete() {
            let n = origin.read(&mut segment).await?;
            if n == 0 {
                debug!("Not caching {}: origin closed mid-body", url);
                return Ok(relayed);
            }
            client.write_all(&segment[..n]).await?;
            relayed += n as u64;
            asm.push(&segment[..n]);

            if asm.buffered() > MAX_CACHEABLE_SIZE {
                debug!("Not caching {}: body too large", url);
                return Ok(relayed + passthrough(origin, client).await?);
            }
        }
        let (header, chunks) = asm.into_parts();
        commit(state, &header, url, Some(chunks));
    } else {
        let mut body = first;
        if head.content_length.is_some() && head.expected_len().is_none() {
            debug!("Not caching {}: Content-Length out of range", url);
            return Ok(relayed + passthrough(origin, client).await?);
        }
        if let Some(expected) = head.expected_len() {
            if expected > MAX_CACHEABLE_SIZE {
                debug!("Not caching {}: body too large", url);
                return Ok(relayed + passthrough(origin, client).await?);
            }
            while body.len() < expected {
                let n = origin.read(&mut segment).await?;
                if n == 0 {
                    debug!("Not caching {}: origin closed mid-body", url);
                    return Ok(relayed);
                }
                client.write_all(&segment[..n]).await?;
                relayed += n as u64;
                body.extend_from_slice(&segment[..n]);
            }
            body.truncate(expected);
        }
        commit(state, &body, url, None);
    }

    Ok(relayed + passthrough(origin, client).await?)
}

fn commit(state: &ProxyState, response: &[u8], url: &str, chunks: Option<Vec<Vec<u8>>>) {
    match state.cache.store(response, url, chunks, unix_now()) {
        Ok(size) => debug!("Cached {} ({} bytes)", url, size),
        Err(skip) => debug!("Not caching {}: {}", url, skip),
    }
}

async fn passthrough<R, W>(origin: &mut R, client: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy(origin, client).await {
        Ok(n) => Ok(n),
        Err(e) if is_expected_error(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

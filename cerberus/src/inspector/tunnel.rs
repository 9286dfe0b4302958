//! 单条 CONNECT 隧道：读取请求、分派、双向转发

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::buffer_pool::BufferSlot;

use super::connections::{ConnectionGuard, FailureStage, RejectReason, TunnelMode};
use super::proxy::ProxyContext;

/// 请求头上限
pub const MAX_REQUEST_HEAD: usize = 8 * 1024;
pub const DEFAULT_TARGET_PORT: u16 = 443;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const METHOD_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("invalid CONNECT target: {0}")]
    InvalidTarget(String),
}

/// CONNECT 目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Connect(Target),
    Other { method: String },
}

/// 解析 `host:port`，缺省端口 443，IPv6 字面量需要方括号
pub fn parse_authority(authority: &str) -> Option<Target> {
    let (host, port) = match authority.strip_prefix('[') {
        Some(rest) => {
            let (host, after) = rest.split_once(']')?;
            host.parse::<Ipv6Addr>().ok()?;
            let port = match after {
                "" => DEFAULT_TARGET_PORT,
                p => p.strip_prefix(':')?.parse().ok()?,
            };
            (host, port)
        }
        None => match authority.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => return None,
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, DEFAULT_TARGET_PORT),
        },
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(Target {
        host: host.to_ascii_lowercase(),
        port,
    })
}

/// 只看请求行，其余头部忽略
pub fn parse_request_head(head: &str) -> Result<Request, RequestError> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::MalformedRequestLine);
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::MalformedRequestLine);
    }
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Request::Other {
            method: method.to_string(),
        });
    }
    parse_authority(target)
        .map(Request::Connect)
        .ok_or_else(|| RequestError::InvalidTarget(target.to_string()))
}

/// 读到空行为止；连接在任何数据之前关闭时返回 None
pub async fn read_request_head<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = String::new();
    let mut limited = reader.take(MAX_REQUEST_HEAD as u64);
    loop {
        let start = head.len();
        let n = limited.read_line(&mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head truncated or larger than 8 KiB",
            ));
        }
        let line = &head[start..];
        if line == "\r\n" || line == "\n" {
            if start == 0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "empty request line"));
            }
            return Ok(Some(head));
        }
    }
}

/// 处理一条已接受的连接，错误只记录日志
pub async fn serve(ctx: Arc<ProxyContext>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = handle(ctx, stream).await {
        debug!("{} 隧道异常结束: {:#}", peer, e);
    }
}

async fn handle(ctx: Arc<ProxyContext>, stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut client = BufReader::new(stream);

    let head = match timeout(ctx.timeouts.read, read_request_head(&mut client)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e).context("read request"),
        Err(_) => bail!("request read timed out"),
    };

    let target = match parse_request_head(&head)? {
        Request::Connect(target) => target,
        Request::Other { method } => {
            debug!("拒绝非 CONNECT 请求: {}", method);
            client.write_all(METHOD_NOT_ALLOWED).await?;
            let _ = client.shutdown().await;
            return Ok(());
        }
    };

    let Some(mut buffers) = ctx.pool.try_acquire_many(2) else {
        ctx.stats.rejected(RejectReason::BufferPool);
        client.write_all(SERVICE_UNAVAILABLE).await?;
        bail!("buffer pool exhausted");
    };
    let (Some(upstream_buf), Some(client_buf)) = (buffers.pop(), buffers.pop()) else {
        bail!("buffer pool returned too few slots");
    };

    let mode = if !ctx.settings.inspect_https() || ctx.bypass.matches(&target.host).await {
        TunnelMode::Bypass
    } else {
        TunnelMode::Mitm
    };
    let guard = ctx.connections.open(
        &ctx.stats,
        &target.host,
        target.port,
        mode,
        ctx.settings.log_connections(),
    );

    let buffers = RelayBuffers {
        outbound: client_buf,
        inbound: upstream_buf,
    };
    match mode {
        TunnelMode::Bypass => bypass(&ctx, client, &target, &guard, buffers).await,
        TunnelMode::Mitm => mitm(&ctx, client, &target, &guard, buffers).await,
    }
}

async fn bypass(
    ctx: &ProxyContext,
    mut client: BufReader<TcpStream>,
    target: &Target,
    guard: &ConnectionGuard,
    buffers: RelayBuffers,
) -> Result<()> {
    let dial = TcpStream::connect((target.host.as_str(), target.port));
    let upstream = match timeout(ctx.timeouts.connect, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            ctx.stats.failed(FailureStage::Upstream);
            return Err(e).with_context(|| format!("connect to {}:{}", target.host, target.port));
        }
        Err(_) => {
            ctx.stats.failed(FailureStage::Upstream);
            bail!("connect to {}:{} timed out", target.host, target.port);
        }
    };
    let _ = upstream.set_nodelay(true);

    client.write_all(CONNECTION_ESTABLISHED).await?;
    relay(client, upstream, guard, buffers, ctx.timeouts.write, Teardown::HalfClose).await?;
    Ok(())
}

async fn mitm(
    ctx: &ProxyContext,
    mut client: BufReader<TcpStream>,
    target: &Target,
    guard: &ConnectionGuard,
    buffers: RelayBuffers,
) -> Result<()> {
    let upstream = match ctx
        .upstream
        .connect(&target.host, target.port, ctx.timeouts.connect)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            ctx.stats.failed(FailureStage::Upstream);
            return Err(e);
        }
    };

    client.write_all(CONNECTION_ESTABLISHED).await?;

    let cert = match ctx.ca.cert_for_host(&target.host) {
        Ok(cert) => cert,
        Err(e) => {
            ctx.stats.failed(FailureStage::Handshake);
            return Err(anyhow!(e)).context("issue leaf certificate");
        }
    };
    let acceptor = TlsAcceptor::from(cert.server_config.clone());
    let client = match timeout(ctx.timeouts.read, acceptor.accept(client)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            ctx.stats.failed(FailureStage::Handshake);
            return Err(e).context("client TLS handshake");
        }
        Err(_) => {
            ctx.stats.failed(FailureStage::Handshake);
            bail!("client TLS handshake timed out");
        }
    };

    relay(client, upstream, guard, buffers, ctx.timeouts.write, Teardown::Both).await?;
    Ok(())
}

struct RelayBuffers {
    /// 客户端 -> 上游
    outbound: BufferSlot,
    /// 上游 -> 客户端
    inbound: BufferSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// 一个方向结束时只关闭对端写方向，等另一方向自然结束
    HalfClose,
    /// 任一方向结束即拆除整条隧道
    Both,
}

/// 拷贝到 EOF，每次写成功后回调字节数
async fn copy_counted<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    write_timeout: Duration,
    mut on_write: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        timeout(write_timeout, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;
        on_write(n as u64);
        total += n as u64;
    }
}

async fn relay<C, U>(
    client: C,
    upstream: U,
    guard: &ConnectionGuard,
    buffers: RelayBuffers,
    write_timeout: Duration,
    teardown: Teardown,
) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let RelayBuffers {
        mut outbound,
        mut inbound,
    } = buffers;
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let client_to_upstream = async {
        let result = copy_counted(
            &mut client_r,
            &mut upstream_w,
            &mut outbound,
            write_timeout,
            |n| guard.add_out(n),
        )
        .await;
        let _ = upstream_w.shutdown().await;
        result
    };
    let upstream_to_client = async {
        let result = copy_counted(
            &mut upstream_r,
            &mut client_w,
            &mut inbound,
            write_timeout,
            |n| guard.add_in(n),
        )
        .await;
        let _ = client_w.shutdown().await;
        result
    };

    match teardown {
        Teardown::HalfClose => {
            let (out, inn) = tokio::join!(client_to_upstream, upstream_to_client);
            out?;
            inn?;
        }
        Teardown::Both => {
            let result = tokio::select! {
                r = client_to_upstream => r,
                r = upstream_to_client => r,
            };
            result?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("Example.com:8443"),
            Some(Target {
                host: "example.com".into(),
                port: 8443
            })
        );
        assert_eq!(parse_authority("example.com").map(|t| t.port), Some(443));
        assert_eq!(
            parse_authority("[::1]:9443"),
            Some(Target {
                host: "::1".into(),
                port: 9443
            })
        );
        assert_eq!(parse_authority("[2001:db8::1]").map(|t| t.port), Some(443));
        assert_eq!(parse_authority("::1:443"), None);
        assert_eq!(parse_authority("[not-ipv6]:443"), None);
        assert_eq!(parse_authority("host:0"), None);
        assert_eq!(parse_authority("host:http"), None);
        assert_eq!(parse_authority(":443"), None);
    }

    #[test]
    fn test_parse_request_head() {
        assert_eq!(
            parse_request_head("CONNECT a.test:443 HTTP/1.1\r\nHost: a.test\r\n\r\n"),
            Ok(Request::Connect(Target {
                host: "a.test".into(),
                port: 443
            }))
        );
        assert_eq!(
            parse_request_head("GET / HTTP/1.1\r\n\r\n"),
            Ok(Request::Other {
                method: "GET".into()
            })
        );
        assert_eq!(
            parse_request_head("CONNECT HTTP/1.1\r\n\r\n"),
            Err(RequestError::MalformedRequestLine)
        );
        assert_eq!(
            parse_request_head("CONNECT a.test:443 SPDY/3\r\n\r\n"),
            Err(RequestError::MalformedRequestLine)
        );
        assert!(matches!(
            parse_request_head("CONNECT a.test:99999 HTTP/1.1\r\n\r\n"),
            Err(RequestError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_head_limits() {
        let mut ok: &[u8] = b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test\r\n\r\nclient-hello";
        let head = read_request_head(&mut ok).await.unwrap().unwrap();
        assert!(head.ends_with("\r\n\r\n"));
        // 请求头之后的数据留在缓冲区
        assert_eq!(ok, b"client-hello");

        let mut empty: &[u8] = b"";
        assert!(read_request_head(&mut empty).await.unwrap().is_none());

        let mut truncated: &[u8] = b"CONNECT a.test:443 HTTP/1.1\r\nHost";
        assert!(read_request_head(&mut truncated).await.is_err());

        let big = format!("CONNECT a.test:443 HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "x".repeat(9000));
        let mut big = big.as_bytes();
        assert!(read_request_head(&mut big).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_counted_reports_each_write() {
        let mut src: &[u8] = &[7u8; 10_000];
        let mut dst = Vec::new();
        let mut buf = vec![0u8; 4096];
        let mut writes = Vec::new();
        let total = copy_counted(&mut src, &mut dst, &mut buf, Duration::from_secs(1), |n| {
            writes.push(n)
        })
        .await
        .unwrap();
        assert_eq!(total, 10_000);
        assert_eq!(writes, vec![4096, 4096, 1808]);
        assert_eq!(dst.len(), 10_000);
    }
}

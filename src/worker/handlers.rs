use std::os::fd::RawFd;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{LoadBalancer, SelectedBackend};
use crate::core::channel::Channel;
use crate::core::socket::write_nonblocking;
use crate::error::Error;
use crate::protocol::http1::{HttpRequest, parse_request};
use crate::protocol::transcode::{FrameTranscoder, Transcoder};

use super::handler::{Disposition, TaskHandler};
use super::task::Task;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Per-request routing handler for the gateway binary.
///
/// Parses the task payload, picks a backend (affinity key from
/// `X-Client-Id`, else the peer address), holds a live connection on it
/// for the duration of the response, and answers with where the request was
/// routed.
pub struct GatewayHandler {
    lb: Arc<LoadBalancer>,
    transcoder: FrameTranscoder,
    proxy_id: String,
    pub served: u64,
    pub rejected: u64,
}

struct Reply {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    close: bool,
}

impl GatewayHandler {
    pub fn new(lb: Arc<LoadBalancer>, worker: usize) -> Self {
        Self {
            lb,
            transcoder: FrameTranscoder::default(),
            proxy_id: format!("gatehouse-{worker}"),
            served: 0,
            rejected: 0,
        }
    }

    fn affinity_key(task: &Task, request: &HttpRequest) -> Option<Vec<u8>> {
        if let Some(id) = request.headers.get(CLIENT_ID_HEADER) {
            return Some(id.as_bytes().to_vec());
        }
        task.peer.map(|p| p.ip().to_string().into_bytes())
    }

    fn routed(&self, request: &HttpRequest, backend: &SelectedBackend) -> Reply {
        let mut headers = vec![("X-Backend", backend.addr.to_string())];
        let text = format!(
            "{} {} routed to backend {} at {}\n",
            request.method, request.path, backend.id, backend.addr
        );

        let body = if request.headers.has_token("accept-encoding", "gzip") {
            match self.transcoder.compress(text.as_bytes()) {
                Ok(gz) => {
                    headers.push(("Content-Encoding", "gzip".to_string()));
                    gz
                }
                Err(e) => {
                    debug!(error = %e, "compression skipped");
                    text.into_bytes()
                }
            }
        } else {
            text.into_bytes()
        };

        Reply {
            status: 200,
            reason: "OK",
            headers,
            body,
            close: request.wants_close(),
        }
    }

    fn plain(status: u16, reason: &'static str, close: bool) -> Reply {
        Reply {
            status,
            reason,
            headers: Vec::new(),
            body: format!("{reason}\n").into_bytes(),
            close,
        }
    }

    fn encode(&self, reply: &Reply) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nX-Proxy-ID: {}\r\n",
            reply.status,
            reply.reason,
            reply.body.len(),
            self.proxy_id
        );
        for (name, value) in &reply.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if reply.close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&reply.body);
        out
    }

    fn send(&self, fd: RawFd, reply: &Reply) -> bool {
        let bytes = self.encode(reply);
        match write_nonblocking(fd, &bytes) {
            Ok(n) if n == bytes.len() => true,
            Ok(n) => {
                warn!(fd, written = n, total = bytes.len(), "short response write");
                false
            }
            Err(e) => {
                debug!(fd, error = %e, "response write failed");
                false
            }
        }
    }
}

impl TaskHandler for GatewayHandler {
    fn handle(&mut self, task: &Task, origin: Option<RawFd>) -> Disposition {
        let Some(fd) = origin else {
            debug!(handle = %task.origin, "origin gone before its task ran");
            return Disposition::Keep;
        };

        let request = match parse_request(&task.payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(fd, error = %e, "unparsable request");
                self.rejected += 1;
                self.send(fd, &Self::plain(400, "Bad Request", true));
                return Disposition::Close;
            }
        };

        let key = Self::affinity_key(task, &request);
        let backend = match self.lb.select_backend(key.as_deref()) {
            Ok(b) => b,
            Err(Error::NoEligibleBackend) => {
                self.rejected += 1;
                let reply = Self::plain(503, "Service Unavailable", request.wants_close());
                let ok = self.send(fd, &reply);
                return if ok && !reply.close {
                    Disposition::Keep
                } else {
                    Disposition::Close
                };
            }
            Err(e) => {
                warn!(fd, error = %e, "backend selection failed");
                self.rejected += 1;
                self.send(fd, &Self::plain(500, "Internal Server Error", true));
                return Disposition::Close;
            }
        };

        self.lb.incr_conn_count(&backend);
        let reply = self.routed(&request, &backend);
        let ok = self.send(fd, &reply);
        if let Err(e) = self.lb.decr_conn_count(&backend) {
            warn!(backend = %backend.id, error = %e, "connection release rejected");
        }
        self.served += 1;
        debug!(fd, backend = %backend.id, path = %request.path, "request routed");

        if ok && !reply.close {
            Disposition::Keep
        } else {
            Disposition::Close
        }
    }

    fn on_close(&mut self, channel: &Channel) {
        debug!(fd = channel.fd, handle = %channel.handle, "client channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDescriptor, Policy};
    use crate::core::channel::ChannelHandle;
    use crate::worker::task::Priority;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn task(payload: &[u8]) -> Task {
        Task {
            priority: Priority::Normal,
            worker: 0,
            origin: ChannelHandle {
                index: 0,
                generation: 1,
            },
            peer: None,
            payload: payload.to_vec(),
        }
    }

    fn lb(warm: bool) -> Arc<LoadBalancer> {
        let lb = LoadBalancer::new(Policy::Affinity, Duration::from_secs(60));
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        lb.add_backend(if warm {
            BackendDescriptor::warm(ip, 9000, 1)
        } else {
            BackendDescriptor::new(ip, 9000, 1)
        });
        Arc::new(lb)
    }

    fn reply_of(handler: &mut GatewayHandler, payload: &[u8]) -> (Disposition, String) {
        let (a, mut b) = UnixStream::pair().unwrap();
        let d = handler.handle(&task(payload), Some(a.as_raw_fd()));
        drop(a);
        let mut out = Vec::new();
        b.read_to_end(&mut out).unwrap();
        (d, String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn test_routes_and_releases_connection() {
        let lb = lb(true);
        let mut h = GatewayHandler::new(Arc::clone(&lb), 0);
        let (d, resp) = reply_of(&mut h, b"GET /run HTTP/1.1\r\nX-Client-Id: u1\r\n\r\n");
        assert_eq!(d, Disposition::Keep);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("X-Proxy-ID: gatehouse-0"));
        assert!(resp.contains("127.0.0.1:9000"));
        assert_eq!(lb.total_live_connections(), 0);
        assert_eq!(h.served, 1);
    }

    #[test]
    fn test_no_backend_is_503() {
        let mut h = GatewayHandler::new(lb(false), 0);
        let (d, resp) = reply_of(&mut h, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(d, Disposition::Keep);
        assert!(resp.starts_with("HTTP/1.1 503"));
    }

    #[test]
    fn test_garbage_is_400_and_close() {
        let mut h = GatewayHandler::new(lb(true), 0);
        let (d, resp) = reply_of(&mut h, b"\x00\x01 nonsense\r\n\r\n");
        assert_eq!(d, Disposition::Close);
        assert!(resp.starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn test_missing_origin_is_skipped() {
        let lb = lb(true);
        let mut h = GatewayHandler::new(Arc::clone(&lb), 0);
        assert_eq!(h.handle(&task(b"GET / HTTP/1.1\r\n\r\n"), None), Disposition::Keep);
        assert_eq!(h.served, 0);
    }
}

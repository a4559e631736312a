//! 节点服务器: mio reactor
//!
//! 单线程接受节点连接, 把 socket 就绪事件转换为通道状态变化。
//! 不会阻塞在 I/O 上, 也不会等待调度线程。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::SockRef;

use super::channel::NodeChannel;
use crate::context::DriverContext;
use crate::Result;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct NodeServer {
    ctx: Arc<DriverContext>,
    poll: Poll,
    listener: TcpListener,
}

impl NodeServer {
    /// 绑定节点端口, 返回服务器和实际绑定的地址
    pub fn bind(ctx: &Arc<DriverContext>, addr: SocketAddr) -> Result<(Self, SocketAddr)> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let local = listener.local_addr()?;
        ctx.set_waker(Arc::new(waker));
        ctx.set_local_addr(local);
        log::info!("node server listening on {}", local);
        Ok((
            Self {
                ctx: Arc::clone(ctx),
                poll,
                listener,
            },
            local,
        ))
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        while !self.ctx.is_stopped() {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("reactor poll failed: {}", e);
                break;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    Token(id) => self.channel_event(id, event),
                }
            }
        }
        let channels = self.ctx.connections_snapshot();
        log::info!("node server stopping, closing {} channels", channels.len());
        for channel in channels {
            channel.close();
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.open(stream, peer) {
                        log::warn!("rejected connection from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn open(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;
        let registry = self.poll.registry().try_clone()?;
        let id = self.ctx.next_channel_id();
        let channel = NodeChannel::open(&self.ctx, id, stream, registry, peer)?;
        self.ctx.add_connection(channel);
        log::debug!("accepted node connection {} from {}", id, peer);
        Ok(())
    }

    fn channel_event(&self, id: usize, event: &Event) {
        let Some(channel) = self.ctx.connection(id) else {
            return;
        };
        if event.is_error() {
            channel.handle_exception("socket error");
            return;
        }
        if event.is_readable() || event.is_read_closed() {
            channel.on_readable();
        }
        if event.is_writable() && !channel.is_closed() {
            channel.on_writable();
        }
    }
}

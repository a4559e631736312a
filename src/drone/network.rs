//! 节点连接的工蜂端: 带读超时的阻塞 socket

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::proto::{GridMessage, MessageReader};
use crate::Result;

pub struct DroneNetwork {
    stream: TcpStream,
    reader: MessageReader,
}

impl DroneNetwork {
    pub fn connect(driver: SocketAddr, read_timeout: Duration, max_blob_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(driver)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(read_timeout))?;
        log::debug!("drone connected to {}", driver);
        Ok(Self {
            stream,
            reader: MessageReader::new(max_blob_size),
        })
    }

    pub fn send(&mut self, msg: GridMessage) -> Result<()> {
        let data = msg.encode();
        self.stream.write_all(&data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// 读超时先到时返回 `Ok(None)`, 不完整的消息保留在缓冲区
    pub fn receive(&mut self) -> Result<Option<GridMessage>> {
        match self.reader.read_from(&mut self.stream)? {
            Some(frames) => GridMessage::from_frames(frames).map(Some),
            None => Ok(None),
        }
    }
}

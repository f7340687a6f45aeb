//! The relay seam of the tunnel: anything that can open a byte channel to a
//! target endpoint.

use super::types::Endpoint;
use crate::error::{Error, Result};
use futures::io::{AsyncRead, AsyncWrite};
use smol::net::TcpStream;
use std::any::Any;
use std::future::Future;

pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Whatever must stay alive while a channel is in use (session processes,
/// temp dirs). Dropped once both copy directions have finished.
pub type Keepalive = Box<dyn Any + Send>;

/// A logical channel to the target, split into its two directions.
pub struct RelayChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
    keepalive: Option<Keepalive>,
}

impl RelayChannel {
    pub fn new(reader: ChannelReader, writer: ChannelWriter) -> Self {
        Self {
            reader,
            writer,
            keepalive: None,
        }
    }

    pub fn with_keepalive(mut self, guard: impl Any + Send) -> Self {
        self.keepalive = Some(Box::new(guard));
        self
    }

    pub(crate) fn into_parts(self) -> (ChannelReader, ChannelWriter, Option<Keepalive>) {
        (self.reader, self.writer, self.keepalive)
    }
}

/// Opens logical channels to a target through some relay.
///
/// Called once per accepted tunnel connection.
pub trait RelayConnector: Send + Sync + 'static {
    fn open_channel(&self, target: &Endpoint) -> impl Future<Output = Result<RelayChannel>> + Send;
}

/// Dials the target directly over TCP, without any relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectRelay;

impl RelayConnector for DirectRelay {
    async fn open_channel(&self, target: &Endpoint) -> Result<RelayChannel> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| Error::TargetDial {
                endpoint: target.to_string(),
                message: e.to_string(),
            })?;

        Ok(RelayChannel::new(Box::new(stream.clone()), Box::new(stream)))
    }
}

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use super::ControlError;
use crate::endpoint::{Endpoint, Mapping};
use crate::wire::{Message, WireCodec};

/// Send `message` to the control socket at `path` and wait for the reply.
pub async fn request<P>(path: P, message: Message) -> Result<Message, ControlError>
where
    P: AsRef<Path>,
{
    let stream = UnixStream::connect(path).await?;
    let mut framed = Framed::new(stream, WireCodec::new());

    framed.send(message).await?;

    let reply = framed.next().await.ok_or(ControlError::Closed)??;
    Ok(reply)
}

async fn acknowledged<P>(path: P, message: Message) -> Result<(), ControlError>
where
    P: AsRef<Path>,
{
    match request(path, message).await? {
        Message::Ack(true) => Ok(()),
        Message::Ack(false) => Err(ControlError::Rejected),
        x => Err(ControlError::UnexpectedReply(x)),
    }
}

pub async fn add<P>(path: P, src: Endpoint, dest: Endpoint) -> Result<(), ControlError>
where
    P: AsRef<Path>,
{
    acknowledged(path, Message::AddProxy { src, dest }).await
}

pub async fn del<P>(path: P, src: Endpoint) -> Result<(), ControlError>
where
    P: AsRef<Path>,
{
    acknowledged(path, Message::DelProxy { src }).await
}

pub async fn list<P>(path: P) -> Result<Vec<Mapping>, ControlError>
where
    P: AsRef<Path>,
{
    match request(path, Message::GetProxies(Vec::new())).await? {
        Message::GetProxies(x) => Ok(x),
        x => Err(ControlError::UnexpectedReply(x)),
    }
}

pub async fn quit<P>(path: P) -> Result<(), ControlError>
where
    P: AsRef<Path>,
{
    acknowledged(path, Message::Quit).await
}

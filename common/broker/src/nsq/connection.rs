use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use super::protocol::{Command, Frame, NsqCodec, ProtocolError, MAGIC_V2, OK};
use super::NsqConfig;
use crate::BrokerError;

pub(crate) type NsqConnection = Framed<TcpStream, NsqCodec>;

#[derive(Serialize)]
struct Identify<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_timeout: Option<u128>,
}

/// Dial nsqd and complete the handshake: magic, IDENTIFY, then wait for OK.
pub(crate) async fn connect(addr: &str, config: &NsqConfig) -> Result<NsqConnection, BrokerError> {
    let connect_error = |source: std::io::Error| BrokerError::Connect {
        addr: addr.to_owned(),
        source,
    };

    let mut stream = timeout(config.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| connect_error(std::io::ErrorKind::TimedOut.into()))?
        .map_err(connect_error)?;
    stream.set_nodelay(true).map_err(connect_error)?;
    stream.write_all(MAGIC_V2).await.map_err(connect_error)?;

    let identify = Identify {
        client_id: &config.client_id,
        hostname: &config.hostname,
        user_agent: &config.user_agent,
        feature_negotiation: false,
        heartbeat_interval: config.heartbeat_interval.as_millis(),
        msg_timeout: config.msg_timeout.map(|t| t.as_millis()),
    };
    let body = serde_json::to_vec(&identify)
        .map_err(|e| ProtocolError::UnexpectedResponse(e.to_string()))?;

    let mut conn = Framed::new(stream, NsqCodec);
    conn.send(Command::Identify(body.into())).await?;
    expect_ok(&mut conn, config.dial_timeout).await?;
    debug!("identified to nsqd at {}", addr);

    Ok(conn)
}

/// Wait for an OK response, answering heartbeats in the meantime.
pub(crate) async fn expect_ok(conn: &mut NsqConnection, wait: Duration) -> Result<(), BrokerError> {
    loop {
        let frame = timeout(wait, conn.next())
            .await
            .map_err(|_| BrokerError::Timeout)?;
        match frame {
            Some(Ok(frame)) if frame.is_heartbeat() => conn.send(Command::Nop).await?,
            Some(Ok(Frame::Response(body))) if body == OK => return Ok(()),
            Some(Ok(Frame::Response(body))) => {
                return Err(ProtocolError::UnexpectedResponse(lossy(&body)).into())
            }
            Some(Ok(Frame::Error(body))) => return Err(BrokerError::Rejected(lossy(&body))),
            Some(Ok(Frame::Message(message))) => {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "message {} before subscribing",
                    message.id()
                ))
                .into())
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(BrokerError::ConnectionClosed),
        }
    }
}

pub(crate) fn lossy(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

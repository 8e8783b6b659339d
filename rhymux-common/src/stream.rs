use crate::{decode_packet, encode_packet, BinaryData, MAX_FRAME_LEN, PROTOCOL_VERSION};
use anyhow::{bail, Error, Result};
use std::{
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{error, trace, warn};

/// A length-prefixed, typed duplex stream over a `TcpStream`.
///
/// The handshake always writes our own [`PROTOCOL_VERSION`] first, then
/// reads the peer's version byte. A mismatch is returned as an error and
/// the caller must drop the connection without proceeding any further —
/// in particular, without issuing any upstream identity call.
pub struct Stream<S, R> {
    send_tx: Arc<mpsc::Sender<S>>,
    closed: Arc<AtomicBool>,

    send_task_handle: JoinHandle<()>,
    recv_task_handle: JoinHandle<Result<()>>,

    _marker: PhantomData<(S, R)>,
}

impl<S, R> Stream<S, R>
where
    S: BinaryData + std::fmt::Debug + Send + Sync + 'static,
    R: BinaryData + std::fmt::Debug + Send + 'static,
{
    pub async fn new<F>(
        stream: TcpStream,
        mut handler: Box<dyn FnMut(Arc<mpsc::Sender<S>>, R) -> F + Send + Sync>,
    ) -> Result<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        stream.set_nodelay(true)?;
        let (mut read, mut write) = stream.into_split();

        write.write_u8(PROTOCOL_VERSION).await?;
        let peer_version = read.read_u8().await?;
        if peer_version != PROTOCOL_VERSION {
            bail!("protocol-version-mismatch");
        }

        let (send_tx, mut send_rx) = mpsc::channel(1024);
        let send_tx = Arc::new(send_tx);
        let closed = Arc::new(AtomicBool::new(false));
        let send_task_handle = tokio::spawn({
            let closed = Arc::clone(&closed);
            async move {
                let mut buffer = Vec::new();
                // A single in-flight write at a time: the channel drains
                // strictly in send order, respecting socket back-pressure.
                while let Some(payload) = send_rx.recv().await {
                    buffer.clear();
                    encode_packet(&payload, &mut buffer);
                    trace!("sending {} bytes ({payload:?}): {buffer:?}", buffer.len());

                    if let Err(err) = async {
                        write.write_u32_le(buffer.len() as u32).await?;
                        write.write_all(&buffer).await?;
                        Ok::<_, Error>(())
                    }
                    .await
                    {
                        error!("failed to send: {err:?}");
                        closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            }
        });

        let recv_task_handle = tokio::spawn({
            let send_tx = Arc::clone(&send_tx);
            let closed = Arc::clone(&closed);
            async move {
                let result = async {
                    let mut buffer = Vec::new();
                    loop {
                        let len = read.read_u32_le().await?;
                        if len > MAX_FRAME_LEN {
                            bail!("frame-payload-too-large");
                        }
                        let len = len as usize;

                        buffer.resize(len, 0);
                        read.read_exact(&mut buffer).await?;
                        trace!("received {} bytes: {buffer:?}", buffer.len());

                        let payload: R = match decode_packet(&buffer) {
                            Ok(val) => val,
                            Err(err) => {
                                warn!("invalid packet: {err:?} {buffer:?}");
                                bail!("binary-decode-failed");
                            }
                        };
                        trace!("decodes to {payload:?}");
                        handler(Arc::clone(&send_tx), payload).await;
                    }
                }
                .await;
                closed.store(true, Ordering::SeqCst);
                result
            }
        });

        Ok(Self {
            send_tx,
            closed,

            send_task_handle,
            recv_task_handle,

            _marker: PhantomData,
        })
    }

    pub async fn send(&self, payload: S) -> Result<()> {
        self.send_tx.send(payload).await?;
        Ok(())
    }

    pub fn blocking_send(&self, payload: S) -> Result<()> {
        self.send_tx.blocking_send(payload)?;
        Ok(())
    }

    /// True once either half of the duplex has observed the peer socket is
    /// gone (a failed write, a closed/errored read). A session bound to a
    /// stream in this state is "half-closed" — stale, not actually live.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<S, R> Drop for Stream<S, R> {
    fn drop(&mut self) {
        self.send_task_handle.abort();
        self.recv_task_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClientCommand;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn is_closed_becomes_true_once_the_peer_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            Stream::<ClientCommand, ClientCommand>::new(socket, Box::new(|_, _| async {}))
                .await
                .unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Drive the handshake from the client side, then drop the socket
        // outright so the server side observes a dead connection.
        let mut version = [0u8; 1];
        client.read_exact(&mut version).await.unwrap();
        client.write_u8(version[0]).await.unwrap();
        drop(client);

        let server_stream = accept.await.unwrap();
        assert!(!server_stream.is_closed());
        for _ in 0..50 {
            if server_stream.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(server_stream.is_closed(), "stream should observe the dropped peer");
    }
}

use crate::proxy::stats::SourceStatsCollector;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const HALF_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Attributes transported bytes to a source's upload/download counters.
///
/// On the client side of a splice (`is_client_side = true`) reads carry
/// client→proxy traffic (upload) and writes carry proxy→client traffic
/// (download); on the upstream side the attribution flips. A splice routes
/// every byte through exactly one such wrapper so the counters match the
/// transported volume.
pub struct DirectionalStream<S> {
    inner: S,
    collector: Arc<SourceStatsCollector>,
    is_client_side: bool,
}

impl<S> DirectionalStream<S> {
    pub fn new(inner: S, collector: Arc<SourceStatsCollector>, is_client_side: bool) -> Self {
        Self {
            inner,
            collector,
            is_client_side,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DirectionalStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                if this.is_client_side {
                    this.collector.add_upload(n);
                } else {
                    this.collector.add_download(n);
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DirectionalStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                if this.is_client_side {
                    this.collector.add_download(n as u64);
                } else {
                    this.collector.add_upload(n as u64);
                }
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Copy bytes between the two streams until both directions finish. EOF on
/// one direction half-closes the other; a peer that then neither sends nor
/// closes is cut off after a short grace.
pub async fn relay_bidirectional<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut uplink = tokio::spawn(async move {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    });
    let downlink = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;

    if let Err(err) = downlink {
        tracing::debug!("relay downlink ended with error: {}", err);
    }
    match tokio::time::timeout(HALF_CLOSE_GRACE, &mut uplink).await {
        Ok(Ok(Err(err))) => tracing::debug!("relay uplink ended with error: {}", err),
        Ok(_) => {}
        Err(_) => uplink.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_directional_accounting_is_exact() {
        let collector = Arc::new(SourceStatsCollector::new("x"));
        let (client_here, client_far) = tokio::io::duplex(4096);
        let (upstream_here, upstream_far) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_bidirectional(
            DirectionalStream::new(client_here, collector.clone(), true),
            upstream_here,
        ));

        let (mut client, mut upstream) = (client_far, upstream_far);
        // 10 bytes up in uneven chunks, 7 bytes down
        client.write_all(b"hello").await.unwrap();
        client.write_all(b" pro").await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = vec![0u8; 10];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello prox");

        upstream.write_all(b"replied").await.unwrap();
        let mut buf = vec![0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"replied");

        drop(client);
        drop(upstream);
        relay.await.unwrap();

        assert_eq!(collector.upload(), 10);
        assert_eq!(collector.download(), 7);
    }

    #[tokio::test]
    async fn test_upstream_side_wrapper_flips_attribution() {
        let collector = Arc::new(SourceStatsCollector::new("x"));
        let (near, far) = tokio::io::duplex(4096);
        let mut wrapped = DirectionalStream::new(near, collector.clone(), false);
        let (mut far_read, mut far_write) = tokio::io::split(far);

        wrapped.write_all(b"request bytes").await.unwrap();
        let mut buf = vec![0u8; 13];
        far_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(collector.upload(), 13);

        far_write.write_all(b"resp").await.unwrap();
        let mut buf = vec![0u8; 4];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(collector.download(), 4);
        assert_eq!(collector.upload(), 13);
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        let (client_here, client_far) = tokio::io::duplex(4096);
        let (upstream_here, upstream_far) = tokio::io::duplex(4096);
        let relay = tokio::spawn(relay_bidirectional(client_here, upstream_here));

        let (mut client, mut upstream) = (client_far, upstream_far);
        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = vec![0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();
        // upstream sees the half-close as EOF
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
        drop(upstream);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        relay.await.unwrap();
    }
}

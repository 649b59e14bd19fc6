//! Typed, endianness-aware reads and writes over a byte stream.
//!
//! A [`Channel`] is created with [`Channel::establish`], which performs the
//! sentinel exchange described in the [module docs](super) before returning.
//! The swap flags are private and written only there, so they are fixed for
//! the lifetime of the connection.
//!
//! Each direction is buffered; call [`ChannelWriter::flush`] after every
//! complete outbound message to keep latency low.

use tokio::io::{
    split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tracing::debug;

use super::{ByteOrder, ChannelError, Endpoint, Scalar, Stream, ENDIANNESS_SENTINEL};

// ── Reader ────────────────────────────────────────────────────────────────────

/// The inbound half of a channel.
#[derive(Debug)]
pub struct ChannelReader<R> {
    inner: BufReader<R>,
    order: ByteOrder,
    swap_on_read: bool,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    fn new(inner: R, order: ByteOrder) -> Self {
        Self {
            inner: BufReader::new(inner),
            order,
            swap_on_read: false,
        }
    }

    /// This end's byte order.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// `true` if the peer writes in the opposite byte order.
    pub fn swaps_on_read(&self) -> bool {
        self.swap_on_read
    }

    /// The byte order inbound scalars are encoded in.
    pub fn wire_order(&self) -> ByteOrder {
        if self.swap_on_read {
            self.order.reversed()
        } else {
            self.order
        }
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChannelError::Closed),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Reads one scalar, swapping it if the peer's byte order differs.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] on EOF, [`ChannelError::Io`] on any other failure.
    pub async fn read_scalar<T: Scalar>(&mut self) -> Result<T, ChannelError> {
        debug_assert!(T::SIZE <= 8);
        let mut storage = [0u8; 8];
        let raw = &mut storage[..T::SIZE];
        self.fill(raw).await?;
        Ok(T::read_from(self.wire_order(), raw))
    }

    /// Reads `count` consecutive scalars.
    pub async fn read_array<T: Scalar>(&mut self, count: usize) -> Result<Vec<T>, ChannelError> {
        let bytes = self.read_bytes(count * T::SIZE).await?;
        let order = self.wire_order();
        Ok(bytes
            .chunks_exact(T::SIZE)
            .map(|chunk| T::read_from(order, chunk))
            .collect())
    }

    /// Reads exactly `len` raw bytes.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// The outbound half of a channel.
#[derive(Debug)]
pub struct ChannelWriter<W> {
    inner: BufWriter<W>,
    order: ByteOrder,
    swap_on_write: bool,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    fn new(inner: W, order: ByteOrder) -> Self {
        Self {
            inner: BufWriter::new(inner),
            order,
            swap_on_write: false,
            scratch: Vec::with_capacity(8),
        }
    }

    /// This end's byte order.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Always `false` once the channel is established.
    pub fn swaps_on_write(&self) -> bool {
        self.swap_on_write
    }

    /// The byte order outbound scalars are encoded in.
    pub fn wire_order(&self) -> ByteOrder {
        if self.swap_on_write {
            self.order.reversed()
        } else {
            self.order
        }
    }

    /// Buffers one scalar.
    pub async fn write_scalar<T: Scalar>(&mut self, value: T) -> Result<(), ChannelError> {
        self.scratch.clear();
        value.write_to(self.wire_order(), &mut self.scratch);
        self.inner.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Buffers a run of scalars.
    pub async fn write_array<T: Scalar>(&mut self, values: &[T]) -> Result<(), ChannelError> {
        self.scratch.clear();
        let order = self.wire_order();
        for value in values {
            value.write_to(order, &mut self.scratch);
        }
        self.inner.write_all(&self.scratch).await?;
        Ok(())
    }

    /// Buffers raw bytes unchanged.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.inner.write_all(bytes).await?;
        Ok(())
    }

    /// Pushes all buffered bytes onto the transport.
    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes, then half-closes the write side (TCP FIN / Unix `shutdown(Write)`).
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// A duplex stream with negotiated byte order.
#[derive(Debug)]
pub struct Channel<S> {
    reader: ChannelReader<ReadHalf<S>>,
    writer: ChannelWriter<WriteHalf<S>>,
}

impl Channel<Stream> {
    /// Connects to `endpoint` and negotiates endianness.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Connect`] if the socket cannot be opened, or any error
    /// from [`Channel::establish`].
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ChannelError> {
        let stream = endpoint.connect().await?;
        Channel::establish(stream).await
    }
}

impl<S: AsyncRead + AsyncWrite> Channel<S> {
    /// Negotiates endianness on a freshly connected or accepted stream, using
    /// the machine's native byte order.
    pub async fn establish(stream: S) -> Result<Self, ChannelError> {
        Self::establish_with_order(stream, ByteOrder::native()).await
    }

    /// Negotiates endianness pretending this end uses `order`.
    ///
    /// Production code calls [`Channel::establish`]; this variant lets tests
    /// simulate a peer of the opposite byte order on a single machine.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Endianness`] if the peer's sentinel is unrecognised.
    /// The stream is dropped (and therefore closed) on any error.
    pub async fn establish_with_order(stream: S, order: ByteOrder) -> Result<Self, ChannelError> {
        let (read_half, write_half) = split(stream);
        let mut reader = ChannelReader::new(read_half, order);
        let mut writer = ChannelWriter::new(write_half, order);

        writer.write_scalar(ENDIANNESS_SENTINEL).await?;
        writer.flush().await?;

        let received: u32 = reader.read_scalar().await?;
        if received == ENDIANNESS_SENTINEL {
            reader.swap_on_read = false;
        } else if received == ENDIANNESS_SENTINEL.swap_bytes() {
            reader.swap_on_read = true;
        } else {
            return Err(ChannelError::Endianness { received });
        }
        writer.swap_on_write = false;

        debug!(
            ?order,
            swap_on_read = reader.swap_on_read,
            "endianness negotiated"
        );
        Ok(Self { reader, writer })
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.reader.byte_order()
    }

    pub fn swaps_on_read(&self) -> bool {
        self.reader.swaps_on_read()
    }

    pub fn swaps_on_write(&self) -> bool {
        self.writer.swaps_on_write()
    }

    pub fn reader(&mut self) -> &mut ChannelReader<ReadHalf<S>> {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut ChannelWriter<WriteHalf<S>> {
        &mut self.writer
    }

    pub async fn read_scalar<T: Scalar>(&mut self) -> Result<T, ChannelError> {
        self.reader.read_scalar().await
    }

    pub async fn read_array<T: Scalar>(&mut self, count: usize) -> Result<Vec<T>, ChannelError> {
        self.reader.read_array(count).await
    }

    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ChannelError> {
        self.reader.read_bytes(len).await
    }

    pub async fn write_scalar<T: Scalar>(&mut self, value: T) -> Result<(), ChannelError> {
        self.writer.write_scalar(value).await
    }

    pub async fn write_array<T: Scalar>(&mut self, values: &[T]) -> Result<(), ChannelError> {
        self.writer.write_array(values).await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.writer.write_bytes(bytes).await
    }

    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        self.writer.flush().await
    }

    /// Half-closes the requested directions.
    ///
    /// `write` flushes and sends FIN.  `read` is a no-op: the split stream
    /// offers no read-side half-close, so callers that need to abandon reads
    /// drop the channel (or its reader) instead.
    pub async fn shutdown(&mut self, read: bool, write: bool) -> Result<(), ChannelError> {
        if read {
            debug!("read-side half-close not supported; ignoring");
        }
        if write {
            self.writer.shutdown().await?;
        }
        Ok(())
    }

    /// Separates the channel so one task can read while another writes.
    pub fn into_split(self) -> (ChannelReader<ReadHalf<S>>, ChannelWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn channel_pair(
        left: ByteOrder,
        right: ByteOrder,
    ) -> (Channel<DuplexStream>, Channel<DuplexStream>) {
        let (a, b) = duplex(4096);
        let (a, b) = tokio::join!(
            Channel::establish_with_order(a, left),
            Channel::establish_with_order(b, right)
        );
        (a.expect("left establish"), b.expect("right establish"))
    }

    const ORDER_PAIRS: [(ByteOrder, ByteOrder); 4] = [
        (ByteOrder::Little, ByteOrder::Little),
        (ByteOrder::Little, ByteOrder::Big),
        (ByteOrder::Big, ByteOrder::Little),
        (ByteOrder::Big, ByteOrder::Big),
    ];

    #[tokio::test]
    async fn test_swap_flags_for_every_order_pair() {
        for (left, right) in ORDER_PAIRS {
            // Act
            let (a, b) = channel_pair(left, right).await;

            // Assert
            let differ = left != right;
            assert_eq!(a.swaps_on_read(), differ, "{left:?} vs {right:?}");
            assert_eq!(b.swaps_on_read(), differ, "{left:?} vs {right:?}");
            assert!(!a.swaps_on_write());
            assert!(!b.swaps_on_write());
        }
    }

    #[tokio::test]
    async fn test_scalars_round_trip_bit_for_bit_for_every_order_pair() {
        for (left, right) in ORDER_PAIRS {
            // Arrange
            let (mut a, mut b) = channel_pair(left, right).await;

            // Act
            a.write_scalar(0xDEAD_BEEFu32).await.unwrap();
            a.write_scalar(-12_345i16).await.unwrap();
            a.write_scalar(0x0102_0304_0506_0708u64).await.unwrap();
            a.write_scalar(1.25f32).await.unwrap();
            a.write_scalar(-2.5e-7f64).await.unwrap();
            a.write_scalar(0x7Fu8).await.unwrap();
            a.flush().await.unwrap();

            // Assert
            assert_eq!(b.read_scalar::<u32>().await.unwrap(), 0xDEAD_BEEF);
            assert_eq!(b.read_scalar::<i16>().await.unwrap(), -12_345);
            assert_eq!(b.read_scalar::<u64>().await.unwrap(), 0x0102_0304_0506_0708);
            assert_eq!(b.read_scalar::<f32>().await.unwrap().to_bits(), 1.25f32.to_bits());
            assert_eq!(b.read_scalar::<f64>().await.unwrap().to_bits(), (-2.5e-7f64).to_bits());
            assert_eq!(b.read_scalar::<u8>().await.unwrap(), 0x7F);
        }
    }

    #[tokio::test]
    async fn test_arrays_round_trip_in_both_directions() {
        for (left, right) in ORDER_PAIRS {
            let (mut a, mut b) = channel_pair(left, right).await;
            let values = [1i32, -2, 300_000, i32::MIN];

            a.write_array(&values).await.unwrap();
            a.flush().await.unwrap();
            b.write_array(&[0.5f32, -0.25]).await.unwrap();
            b.flush().await.unwrap();

            assert_eq!(b.read_array::<i32>(values.len()).await.unwrap(), values);
            assert_eq!(a.read_array::<f32>(2).await.unwrap(), vec![0.5, -0.25]);
        }
    }

    #[tokio::test]
    async fn test_unrecognised_sentinel_fails_negotiation() {
        // Arrange: the peer writes a value that is neither the sentinel nor its reversal
        let (a, mut peer) = duplex(64);
        let bogus = 0xCAFE_BABEu32;
        let peer_task = tokio::spawn(async move {
            peer.write_all(&bogus.to_ne_bytes()).await.unwrap();
            let mut discard = [0u8; 4];
            let _ = peer.read_exact(&mut discard).await;
        });

        // Act
        let result = Channel::establish(a).await;

        // Assert
        match result {
            Err(ChannelError::Endianness { received }) => assert_eq!(received, bogus),
            other => panic!("expected Endianness error, got {other:?}"),
        }
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognised_sentinel_fails_on_both_simulated_endpoints() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let (a, mut peer) = duplex(64);
            let (b, mut peer_b) = duplex(64);
            let garbage = [0x12u8, 0x12, 0x12, 0x12];
            peer.write_all(&garbage).await.unwrap();
            peer_b.write_all(&garbage).await.unwrap();

            let (ra, rb) = tokio::join!(
                Channel::establish_with_order(a, order),
                Channel::establish_with_order(b, order.reversed())
            );

            assert!(matches!(ra, Err(ChannelError::Endianness { .. })));
            assert!(matches!(rb, Err(ChannelError::Endianness { .. })));
        }
    }

    #[tokio::test]
    async fn test_peer_closing_before_sentinel_reports_closed() {
        let (a, peer) = duplex(64);
        drop(peer);

        let result = Channel::establish(a).await;

        assert!(matches!(result, Err(ChannelError::Closed) | Err(ChannelError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_shutdown_gives_peer_eof() {
        let (mut a, mut b) = channel_pair(ByteOrder::Little, ByteOrder::Big).await;

        a.write_scalar(7u16).await.unwrap();
        a.shutdown(true, true).await.unwrap();

        assert_eq!(b.read_scalar::<u16>().await.unwrap(), 7);
        assert!(matches!(b.read_scalar::<u8>().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (a, b) = channel_pair(ByteOrder::Big, ByteOrder::Little).await;
        let (mut a_reader, mut a_writer) = a.into_split();
        let (mut b_reader, mut b_writer) = b.into_split();

        let writer_task = tokio::spawn(async move {
            a_writer.write_scalar(42u32).await.unwrap();
            a_writer.flush().await.unwrap();
        });
        b_writer.write_scalar(-1i64).await.unwrap();
        b_writer.flush().await.unwrap();

        assert_eq!(b_reader.read_scalar::<u32>().await.unwrap(), 42);
        assert_eq!(a_reader.read_scalar::<i64>().await.unwrap(), -1);
        assert_eq!(a_reader.wire_order(), ByteOrder::Little);
        writer_task.await.unwrap();
    }
}

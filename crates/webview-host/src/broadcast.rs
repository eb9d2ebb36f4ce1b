//! Per-device fan-out of FRAME chunks to every attached client.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ProtocolError;
use crate::protocol;
use crate::tiles::FrameOutput;

/// Messages a client may fall behind by before it is marked lagged.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

pub struct Broadcaster {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(CLIENT_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Attach a new client to `device_id`. Dropping the receiver detaches it.
    pub fn subscribe(&self, device_id: &str) -> broadcast::Receiver<Bytes> {
        self.channels
            .entry(device_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn client_count(&self, device_id: &str) -> usize {
        self.channels
            .get(device_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Split `output` into FRAME chunks and queue them for every client of
    /// the device. Returns the number of chunks sent; zero when nobody is
    /// attached or the output is empty.
    pub fn send_frame_chunked(
        &self,
        device_id: &str,
        frame_id: u32,
        output: &FrameOutput,
        max_bytes: usize,
    ) -> Result<usize, ProtocolError> {
        let Some(tx) = self.channels.get(device_id).map(|tx| tx.clone()) else {
            return Ok(0);
        };
        if tx.receiver_count() == 0 || output.is_empty() {
            return Ok(0);
        }

        let chunks = protocol::pack_chunks(
            device_id,
            frame_id,
            output.full_frame,
            &output.rects,
            max_bytes,
        )?;
        let count = chunks.len();
        for chunk in chunks {
            // Err only means every receiver went away mid-frame.
            if tx.send(chunk).is_err() {
                trace!(device = %device_id, frame_id, "clients left during send");
                break;
            }
        }
        Ok(count)
    }

    /// Drop the channel of a device nobody listens to anymore.
    pub fn prune(&self, device_id: &str) {
        self.channels
            .remove_if(device_id, |_, tx| tx.receiver_count() == 0);
    }

    #[cfg(test)]
    pub fn device_ids(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_chunk, EncodedRect};

    fn output(n: usize, len: usize) -> FrameOutput {
        FrameOutput {
            rects: (0..n)
                .map(|i| EncodedRect {
                    x: i as u16 * 32,
                    y: 0,
                    width: 32,
                    height: 32,
                    data: Bytes::from(vec![i as u8; len]),
                })
                .collect(),
            full_frame: false,
        }
    }

    #[test]
    fn counts_clients_per_device() {
        let b = Broadcaster::default();
        assert_eq!(b.client_count("a"), 0);
        let r1 = b.subscribe("a");
        let _r2 = b.subscribe("a");
        let _r3 = b.subscribe("b");
        assert_eq!(b.client_count("a"), 2);
        assert_eq!(b.client_count("b"), 1);
        drop(r1);
        assert_eq!(b.client_count("a"), 1);
    }

    #[test]
    fn no_clients_means_nothing_sent() {
        let b = Broadcaster::default();
        assert_eq!(b.send_frame_chunked("a", 1, &output(2, 10), 1000).unwrap(), 0);
        drop(b.subscribe("a"));
        assert_eq!(b.send_frame_chunked("a", 1, &output(2, 10), 1000).unwrap(), 0);
    }

    #[tokio::test]
    async fn every_client_gets_chunks_in_order() {
        let b = Broadcaster::default();
        let mut r1 = b.subscribe("a");
        let mut r2 = b.subscribe("a");
        let mut other = b.subscribe("b");

        let sent = b.send_frame_chunked("a", 9, &output(6, 200), 500).unwrap();
        assert!(sent > 1);

        for rx in [&mut r1, &mut r2] {
            for i in 0..sent {
                let chunk = decode_chunk(&rx.recv().await.unwrap()).unwrap();
                assert_eq!(chunk.frame_id, 9);
                assert_eq!(chunk.chunk_index as usize, i);
            }
        }
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_client_lags_without_blocking_others() {
        let b = Broadcaster::new(4);
        let mut slow = b.subscribe("a");
        let mut fast = b.subscribe("a");
        for frame_id in 1..=10 {
            b.send_frame_chunked("a", frame_id, &output(1, 8), 1000).unwrap();
            let chunk = decode_chunk(&fast.recv().await.unwrap()).unwrap();
            assert_eq!(chunk.frame_id, frame_id);
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn prune_only_removes_unwatched_devices() {
        let b = Broadcaster::default();
        let keep = b.subscribe("a");
        drop(b.subscribe("b"));
        b.prune("a");
        b.prune("b");
        assert_eq!(b.device_ids(), vec!["a".to_string()]);
        drop(keep);
    }
}
